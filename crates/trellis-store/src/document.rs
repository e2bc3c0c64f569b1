//! The stored document shape shared by every axis.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use trellis_codec::{format_timestamp, parse_timestamp};

use crate::error::Result;

/// A stored state document: a payload under the `state` key plus the UTC
/// instant it was recorded, at second precision.
///
/// Older stores wrote the instant under a `timestamp` key and with a
/// fractional-second tail; both are still accepted on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    /// The stored payload.
    pub state: Value,
    /// When the payload was recorded, `YYYY-MM-DD HH:MM:SS` in UTC.
    #[serde(alias = "timestamp")]
    pub timestamp_utc: String,
}

impl StateDocument {
    /// Wrap a payload, stamping it with `at`.
    pub fn wrap(state: Value, at: DateTime<Utc>) -> Self {
        Self {
            state,
            timestamp_utc: format_timestamp(at),
        }
    }

    /// Parse a document from its JSON form.
    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// The instant this document was recorded.
    pub fn timestamp(&self) -> Result<DateTime<Utc>> {
        Ok(parse_timestamp(&self.timestamp_utc)?)
    }

    /// Pretty-printed JSON, the form current documents are stored in.
    pub fn to_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Single-line JSON, the form history entries are stored in.
    pub fn to_compact(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn wrap_stamps_at_second_precision() {
        let at = Utc.with_ymd_and_hms(2024, 3, 10, 12, 30, 45).unwrap();
        let document = StateDocument::wrap(json!({"config": {}}), at);
        assert_eq!(document.timestamp_utc, "2024-03-10 12:30:45");
        assert_eq!(document.timestamp().unwrap(), at);
    }

    #[test]
    fn parse_accepts_the_legacy_timestamp_key() {
        let document =
            StateDocument::parse(r#"{"state": {}, "timestamp": "2023-01-01 00:00:00"}"#).unwrap();
        assert_eq!(document.timestamp_utc, "2023-01-01 00:00:00");
    }

    #[test]
    fn parse_accepts_a_fractional_second_tail() {
        let document =
            StateDocument::parse(r#"{"state": {}, "timestamp_utc": "2023-01-01 00:00:00.123456"}"#)
                .unwrap();
        let at = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(document.timestamp().unwrap(), at);
    }

    #[test]
    fn compact_form_is_one_line() {
        let at = Utc.with_ymd_and_hms(2024, 3, 10, 12, 30, 45).unwrap();
        let document = StateDocument::wrap(json!({"b": 2, "a": 1}), at);
        let line = document.to_compact().unwrap();
        assert!(!line.contains('\n'));
        // Keys serialize sorted, so identical payloads produce identical lines.
        assert_eq!(
            line,
            r#"{"state":{"a":1,"b":2},"timestamp_utc":"2024-03-10 12:30:45"}"#
        );
    }

    #[test]
    fn round_trips_through_pretty_form() {
        let at = Utc.with_ymd_and_hms(2024, 3, 10, 12, 30, 45).unwrap();
        let document = StateDocument::wrap(json!({"config": {"sleep": "60"}}), at);
        let pretty = document.to_pretty().unwrap();
        assert_eq!(StateDocument::parse(&pretty).unwrap(), document);
    }
}
