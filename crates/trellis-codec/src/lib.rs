//! Wire codec for constrained field devices.
//!
//! Things exchange state as terse pipe- and tilde-delimited strings to keep
//! radio time short. This crate is the bidirectional transform between that
//! wire encoding and the structured representation the rest of the system
//! works with:
//!
//! - **Explode** (wire → structured): action rule strings become rule
//!   mappings, sense readings become tagged values with stale-value
//!   carry-forward, and the seconds-since-boot counter becomes a stable
//!   absolute `boot_utc` timestamp.
//! - **Compact** (structured → wire): the inverse for everything a device
//!   can receive back — rules and clock fields. Readings are never sent to
//!   devices, so they are never compacted.
//!
//! The crate has no I/O; both directions are pure functions over JSON
//! values.

pub mod clock;
pub mod error;
pub mod reading;
pub mod rule;
pub mod schema;
pub mod transform;

pub use clock::{clock_to_seconds, format_timestamp, parse_timestamp, seconds_to_clock};
pub use error::{Error, Result};
pub use reading::{
    normalize_capacitive_humidity, scale_capacitive_humidity, PreviousReading, SenseReading,
    CARRY_FORWARD_WINDOW_HOURS, MISSING_FIELD,
};
pub use rule::{ActionRule, RuleField, DEFAULT_WRITE, LEGACY_DELETE_DELTA, TIME_SENSE};
pub use schema::{is_analog, is_capacitive_humidity, role_of, KeyRole, ANALOG_SENSES, BOOT_KEY};
pub use transform::{
    compact, explode, PreviousState, BOOT_CLOCK_JITTER_SECS, TYPICAL_AWAKE_SECS,
};
