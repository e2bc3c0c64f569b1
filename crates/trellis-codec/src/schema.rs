//! Mapping-key classification for the state walkers.
//!
//! Device payloads are plain JSON, but a handful of keys change how a
//! subtree is interpreted. Explode and compact both consult this table
//! instead of matching key strings inline, so adding a specially handled
//! field is a one-line change here.

/// How a mapping key is treated while walking a state tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRole {
    /// Holds action rules, as wire strings or structured mappings.
    Actions,
    /// Holds one reading per sense.
    Senses,
    /// Seconds-of-day value, shown as `H:MM` in structured form.
    TimeOfDay,
    /// Seconds-since-boot counter, exploded to `boot_utc`.
    BootCounter,
    /// No special handling.
    Plain,
}

/// Classify a mapping key. Roles apply at every depth of a payload.
pub fn role_of(key: &str) -> KeyRole {
    match key {
        "actions" => KeyRole::Actions,
        "senses" => KeyRole::Senses,
        "time" => KeyRole::TimeOfDay,
        "b" => KeyRole::BootCounter,
        _ => KeyRole::Plain,
    }
}

/// Key an exploded boot counter is stored under.
pub const BOOT_KEY: &str = "boot_utc";

/// Senses reporting raw capacitive soil humidity. Their readings are
/// normalized to a 0-100 percentage on explode, raw value kept alongside.
pub const CAPACITIVE_HUMIDITY_SENSES: &[&str] = &["I2C-32c"];

/// Senses carrying raw 10-bit ADC values. Consumers seed a percentage
/// scaling formula for these when a thing has no formulas configured yet.
pub const ANALOG_SENSES: &[&str] = &["I2C-8", "I2C-9", "I2C-10"];

/// Whether a sense reports raw capacitive humidity.
pub fn is_capacitive_humidity(sense: &str) -> bool {
    CAPACITIVE_HUMIDITY_SENSES.contains(&sense)
}

/// Whether a sense reports a raw analog value.
pub fn is_analog(sense: &str) -> bool {
    ANALOG_SENSES.contains(&sense)
}
