//! Server clock formats.
//!
//! Persisted timestamps are UTC at second precision, rendered as
//! `YYYY-MM-DD HH:MM:SS` with no timezone suffix. Parsing also accepts the
//! fractional-second tail that older documents were written with.
//!
//! Devices deal in seconds-of-day for their daily schedules; the structured
//! form shows those as `H:MM` clock strings.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use crate::error::{Error, Result};

/// Timestamp format written to documents and history lines.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Legacy variant with a fractional-second tail, accepted on read only.
const TIMESTAMP_FORMAT_SUBSEC: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Render a UTC instant in the persisted format.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a persisted timestamp, tolerating the legacy fractional tail.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT_SUBSEC))
        .map_err(|_| Error::MalformedTimestamp(raw.to_string()))?;
    Ok(Utc.from_utc_datetime(&naive))
}

/// Convert seconds since midnight to the `H:MM` clock form. Hours are not
/// zero-padded, minutes always are.
pub fn seconds_to_clock(seconds: i64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds / 60) % 60;
    format!("{}:{:02}", hours, minutes)
}

/// Convert an `H:MM` clock string back to seconds since midnight.
pub fn clock_to_seconds(clock: &str) -> Result<i64> {
    let (hours, minutes) = clock
        .split_once(':')
        .ok_or_else(|| Error::MalformedTimestamp(clock.to_string()))?;
    let hours: i64 = hours
        .parse()
        .map_err(|_| Error::MalformedTimestamp(clock.to_string()))?;
    let minutes: i64 = minutes
        .parse()
        .map_err(|_| Error::MalformedTimestamp(clock.to_string()))?;
    Ok(hours * 3600 + minutes * 60)
}
