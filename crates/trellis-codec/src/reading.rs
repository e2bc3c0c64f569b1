//! Sense reading wire forms.
//!
//! A reading arrives as one of three shapes: a bare number, a legacy
//! `w`-prefixed wrongness marker, or the rich quadruple
//! `value|expected|ssd|{c,w}` produced by firmware with self-checking
//! senses. The quadruple uses a sentinel integer for fields the device
//! could not fill.
//!
//! When a report arrives wrong with neither a value nor an expectation,
//! the last known-good value is carried forward for up to 24 hours,
//! stamped with the time it was actually observed.

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Number, Value};
use tracing::debug;

use crate::clock::{format_timestamp, parse_timestamp};

/// Sentinel marking a missing field inside the rich quadruple.
pub const MISSING_FIELD: i64 = -1000;

/// How long a known-good value keeps being carried forward.
pub const CARRY_FORWARD_WINDOW_HOURS: i64 = 24;

/// Raw count range a capacitive humidity sense reports.
pub const RAW_HUMIDITY_RANGE: (i64, i64) = (300, 800);

/// A decoded sense reading.
#[derive(Debug, Clone, PartialEq)]
pub enum SenseReading {
    /// Bare numeric reading.
    Number(Number),
    /// Legacy wrongness marker with an optional payload value.
    Wrong(Option<i64>),
    /// Rich quadruple reading.
    Rich {
        value: Option<Number>,
        expected: Option<Number>,
        ssd: Option<Number>,
        wrong: bool,
    },
}

impl SenseReading {
    /// Decode a wire reading. `None` means the value matches no known
    /// form and should pass through unchanged.
    pub fn parse(raw: &Value) -> Option<Self> {
        match raw {
            Value::Number(n) => Some(SenseReading::Number(n.clone())),
            Value::String(s) => Self::parse_str(s),
            _ => None,
        }
    }

    fn parse_str(raw: &str) -> Option<Self> {
        if let Some(rest) = raw.strip_prefix('w') {
            if rest.is_empty() {
                return Some(SenseReading::Wrong(None));
            }
            if let Ok(value) = rest.parse::<i64>() {
                return Some(SenseReading::Wrong(Some(value)));
            }
            // Not a marker after all, try the quadruple form.
        }

        let parts: Vec<&str> = raw.split('|').collect();
        if parts.len() != 4 {
            return None;
        }
        let value = parse_field(parts[0])?;
        let expected = parse_field(parts[1])?;
        let ssd = parse_field(parts[2])?;
        let wrong = match parts[3] {
            "c" => false,
            "w" => true,
            _ => return None,
        };
        Some(SenseReading::Rich {
            value,
            expected,
            ssd,
            wrong,
        })
    }

    /// Whether the current report itself supplied a value.
    pub fn has_fresh_value(&self) -> bool {
        match self {
            SenseReading::Number(_) => true,
            SenseReading::Wrong(value) => value.is_some(),
            SenseReading::Rich { value, .. } => value.is_some(),
        }
    }

    /// Render the structured form. `previous` feeds stale-value
    /// carry-forward when this reading is wrong and offers neither a
    /// value nor an expectation.
    pub fn into_value(self, previous: Option<&PreviousReading>, now: DateTime<Utc>) -> Value {
        match self {
            SenseReading::Number(n) => Value::Number(n),
            SenseReading::Wrong(Some(value)) => {
                let mut map = Map::new();
                map.insert("value".to_string(), Value::Number(Number::from(value)));
                map.insert("wrong".to_string(), Value::Bool(true));
                Value::Object(map)
            }
            SenseReading::Wrong(None) => carry_forward(previous, now, Map::new()),
            SenseReading::Rich {
                value,
                expected,
                ssd,
                wrong,
            } => {
                let mut map = Map::new();
                if let Some(ssd) = ssd {
                    map.insert("ssd".to_string(), Value::Number(ssd));
                }
                if wrong && value.is_none() && expected.is_none() {
                    return carry_forward(previous, now, map);
                }
                if let Some(value) = value {
                    map.insert("value".to_string(), Value::Number(value));
                }
                if let Some(expected) = expected {
                    map.insert("expected".to_string(), Value::Number(expected));
                }
                if wrong {
                    map.insert("wrong".to_string(), Value::Bool(true));
                }
                Value::Object(map)
            }
        }
    }
}

/// The carry-forward candidate extracted from a previously exploded
/// reading.
#[derive(Debug, Clone)]
pub struct PreviousReading {
    /// Last known-good value.
    pub value: Number,
    /// When that value was actually observed.
    pub seen_at: DateTime<Utc>,
}

impl PreviousReading {
    /// Extract the candidate from a previously exploded reading and the
    /// timestamp of the document it came from. Readings flagged wrong are
    /// never carried; a reading that was itself carried keeps its original
    /// observation time through `from`.
    pub fn from_exploded(previous: &Value, document_at: DateTime<Utc>) -> Option<Self> {
        match previous {
            Value::Number(n) => Some(Self {
                value: n.clone(),
                seen_at: document_at,
            }),
            Value::Object(map) => {
                if map.get("wrong").and_then(Value::as_bool).unwrap_or(false) {
                    return None;
                }
                let value = match map.get("value") {
                    Some(Value::Number(n)) => n.clone(),
                    _ => return None,
                };
                let seen_at = match map.get("from").and_then(Value::as_str) {
                    Some(raw) => parse_timestamp(raw).ok()?,
                    None => document_at,
                };
                Some(Self { value, seen_at })
            }
            _ => None,
        }
    }
}

fn carry_forward(
    previous: Option<&PreviousReading>,
    now: DateTime<Utc>,
    mut map: Map<String, Value>,
) -> Value {
    if let Some(previous) = previous {
        let age = now.signed_duration_since(previous.seen_at);
        if age <= Duration::hours(CARRY_FORWARD_WINDOW_HOURS) {
            map.insert("value".to_string(), Value::Number(previous.value.clone()));
            map.insert(
                "from".to_string(),
                Value::String(format_timestamp(previous.seen_at)),
            );
            return Value::Object(map);
        }
        debug!(
            "Known-good value is older than {} hours, not carrying it forward",
            CARRY_FORWARD_WINDOW_HOURS
        );
    }
    map.insert("wrong".to_string(), Value::Bool(true));
    Value::Object(map)
}

fn parse_field(raw: &str) -> Option<Option<Number>> {
    let raw = raw.trim();
    if let Ok(value) = raw.parse::<i64>() {
        if value == MISSING_FIELD {
            return Some(None);
        }
        return Some(Some(Number::from(value)));
    }
    if let Ok(value) = raw.parse::<f64>() {
        if value == MISSING_FIELD as f64 {
            return Some(None);
        }
        return Number::from_f64(value).map(Some);
    }
    None
}

/// Scale a raw capacitive humidity count to a 0-100 percentage, clamped.
pub fn scale_capacitive_humidity(raw: f64) -> i64 {
    let (low, high) = RAW_HUMIDITY_RANGE;
    let normalized = ((raw - low as f64) / (high - low) as f64 * 100.0) as i64;
    normalized.clamp(0, 100)
}

/// Rewrite a capacitive humidity reading so `value` holds the percentage
/// and `original` keeps the raw count. Readings already carrying
/// `original` pass through untouched, which keeps the rewrite idempotent.
pub fn normalize_capacitive_humidity(reading: Value) -> Value {
    match reading {
        Value::Number(n) => match n.as_f64() {
            Some(raw) => {
                let mut map = Map::new();
                map.insert("original".to_string(), Value::Number(n));
                map.insert(
                    "value".to_string(),
                    Value::Number(Number::from(scale_capacitive_humidity(raw))),
                );
                Value::Object(map)
            }
            None => Value::Number(n),
        },
        Value::Object(mut map) => {
            if map.contains_key("original") {
                return Value::Object(map);
            }
            let original = match map.get("value") {
                Some(Value::Number(n)) => n.clone(),
                _ => {
                    debug!("Capacitive humidity reading has no numeric value, leaving it as is");
                    return Value::Object(map);
                }
            };
            let raw = match original.as_f64() {
                Some(raw) => raw,
                None => return Value::Object(map),
            };
            map.insert("original".to_string(), Value::Number(original));
            map.insert(
                "value".to_string(),
                Value::Number(Number::from(scale_capacitive_humidity(raw))),
            );
            Value::Object(map)
        }
        other => other,
    }
}
