//! Action rule wire grammar.
//!
//! Devices evaluate threshold rules locally: when a sense reading crosses
//! `threshold` (within `delta` hysteresis), write `high` or `low` to a GPIO
//! pin. On the wire a rule is the pipe string `sense|gpio|{H,L}|threshold|delta`.
//!
//! A deprecated per-key grammar (`A|sense|gpio{H,L}` mapped to
//! `threshold~delta`) is still decoded for documents written by old
//! firmware, but never produced again.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::clock::{clock_to_seconds, seconds_to_clock};
use crate::error::{Error, Result};

/// Write level used when a rule does not name one.
pub const DEFAULT_WRITE: &str = "high";

/// Sense whose threshold and delta are seconds-of-day.
pub const TIME_SENSE: &str = "time";

/// Key prefix of the deprecated per-key rule grammar.
const LEGACY_PREFIX: &str = "A";

/// Delta value marking a rule for deletion in the deprecated grammar.
pub const LEGACY_DELETE_DELTA: i64 = -2;

/// Threshold or delta of a rule.
///
/// Plain senses carry integer values; `time` rules show `H:MM` clock
/// strings in structured form. Compacting accepts either shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleField {
    /// Integer value, seconds-of-day for `time` rules.
    Seconds(i64),
    /// `H:MM` clock string.
    Clock(String),
}

impl Default for RuleField {
    fn default() -> Self {
        RuleField::Seconds(0)
    }
}

impl RuleField {
    /// Collapse to the integer the wire carries.
    pub fn as_seconds(&self) -> Result<i64> {
        match self {
            RuleField::Seconds(seconds) => Ok(*seconds),
            RuleField::Clock(clock) => clock_to_seconds(clock),
        }
    }
}

/// A threshold-triggered actuator rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRule {
    /// Sense the rule watches.
    pub sense: String,
    /// GPIO pin the rule drives.
    pub gpio: i64,
    /// `high` or `low`.
    #[serde(default = "default_write")]
    pub write: String,
    /// Reading level that triggers the rule.
    pub threshold: RuleField,
    /// Hysteresis around the threshold.
    #[serde(default)]
    pub delta: RuleField,
}

fn default_write() -> String {
    DEFAULT_WRITE.to_string()
}

impl ActionRule {
    /// Parse a rule in the current wire grammar.
    pub fn parse(wire: &str) -> Result<Self> {
        let parts: Vec<&str> = wire.split('|').collect();
        if parts.len() != 5 {
            return Err(Error::MalformedRule(wire.to_string()));
        }
        let sense = parts[0];
        if !is_sense_name(sense) {
            return Err(Error::MalformedRule(wire.to_string()));
        }
        let gpio = parse_unsigned(parts[1]).ok_or_else(|| Error::MalformedRule(wire.to_string()))?;
        let write = match parts[2] {
            "H" => "high",
            "L" => "low",
            _ => return Err(Error::MalformedRule(wire.to_string())),
        };
        let threshold =
            parse_unsigned(parts[3]).ok_or_else(|| Error::MalformedRule(wire.to_string()))?;
        let delta =
            parse_unsigned(parts[4]).ok_or_else(|| Error::MalformedRule(wire.to_string()))?;

        Ok(Self {
            sense: sense.to_string(),
            gpio,
            write: write.to_string(),
            threshold: field_for(sense, threshold),
            delta: field_for(sense, delta),
        })
    }

    /// Parse a rule in the deprecated per-key grammar: key
    /// `A|sense|gpio{H,L}`, value `threshold~delta`. The write letter is
    /// optional and defaults to `high`; a delta of `-2` marks deletion and
    /// is decoded verbatim.
    pub fn parse_legacy(key: &str, value: &str) -> Result<Self> {
        let malformed = || Error::MalformedRule(format!("{}: {}", key, value));

        let parts: Vec<&str> = key.split('|').collect();
        if parts.len() != 3 || parts[0] != LEGACY_PREFIX {
            return Err(malformed());
        }
        let sense = parts[1];
        if !is_sense_name(sense) {
            return Err(malformed());
        }
        let (gpio_part, write) = if let Some(digits) = parts[2].strip_suffix('H') {
            (digits, "high")
        } else if let Some(digits) = parts[2].strip_suffix('L') {
            (digits, "low")
        } else {
            (parts[2], DEFAULT_WRITE)
        };
        let gpio = parse_unsigned(gpio_part).ok_or_else(malformed)?;

        let (threshold, delta) = value.split_once('~').ok_or_else(malformed)?;
        let threshold: i64 = threshold.trim().parse().map_err(|_| malformed())?;
        let delta: i64 = delta.trim().parse().map_err(|_| malformed())?;

        Ok(Self {
            sense: sense.to_string(),
            gpio,
            write: write.to_string(),
            threshold: field_for(sense, threshold),
            delta: field_for(sense, delta),
        })
    }

    /// Render in the current wire grammar.
    pub fn to_wire(&self) -> Result<String> {
        let threshold = self.threshold.as_seconds()?;
        let delta = self.delta.as_seconds()?;
        Ok(format!(
            "{}|{}|{}|{}|{}",
            self.sense,
            self.gpio,
            self.write_letter(),
            threshold,
            delta
        ))
    }

    /// Whether this rule carries the deprecated deletion marker.
    pub fn is_delete(&self) -> bool {
        matches!(self.delta, RuleField::Seconds(LEGACY_DELETE_DELTA))
    }

    fn write_letter(&self) -> char {
        match self.write.as_str() {
            "high" => 'H',
            "low" => 'L',
            other => {
                warn!("Write level is neither high nor low: {}, defaulting to H", other);
                'H'
            }
        }
    }
}

/// For `time` rules, non-negative values read as clock strings. Negative
/// values (the legacy deletion marker) stay numeric.
fn field_for(sense: &str, value: i64) -> RuleField {
    if sense == TIME_SENSE && value >= 0 {
        RuleField::Clock(seconds_to_clock(value))
    } else {
        RuleField::Seconds(value)
    }
}

fn is_sense_name(sense: &str) -> bool {
    !sense.is_empty() && sense.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

fn parse_unsigned(digits: &str) -> Option<i64> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
