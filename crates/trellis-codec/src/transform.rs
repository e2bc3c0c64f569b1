//! The two directions of the wire codec.
//!
//! **Explode** turns a device's terse report into the structured form the
//! store keeps: action rule strings become mappings, sense readings become
//! tagged values with carry-forward applied, the boot counter becomes an
//! absolute `boot_utc` timestamp. **Compact** is the inverse for the
//! configuration shapes a device can receive back; readings are never
//! compacted because devices never receive readings.
//!
//! Both directions walk nested mappings uniformly and consult
//! [`crate::schema`] for the keys that get special handling at any depth.
//! Unparsable units are logged and passed through unchanged rather than
//! dropped.

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::clock::{clock_to_seconds, format_timestamp, parse_timestamp, seconds_to_clock};
use crate::reading::{normalize_capacitive_humidity, PreviousReading, SenseReading};
use crate::rule::ActionRule;
use crate::schema::{self, KeyRole};

/// Clock jitter below which two boot estimates are the same boot.
pub const BOOT_CLOCK_JITTER_SECS: i64 = 3;

/// How long a device typically stays awake between deep sleeps. A boot
/// estimate that moved by one sleep interval plus at most this much is a
/// wake-up, not a reboot.
pub const TYPICAL_AWAKE_SECS: i64 = 20;

/// The previously exploded document a new report is interpreted against.
/// Feeds stale-value carry-forward and boot timestamp stability.
#[derive(Debug, Clone, Copy)]
pub struct PreviousState<'a> {
    /// Exploded payload of the previous reported document.
    pub payload: &'a Value,
    /// Timestamp of that document.
    pub taken_at: DateTime<Utc>,
}

struct Walk {
    previous_taken_at: Option<DateTime<Utc>>,
    sleep: Option<i64>,
    now: DateTime<Utc>,
}

/// Expand a wire payload into structured form.
pub fn explode(payload: &Value, previous: Option<PreviousState>, now: DateTime<Utc>) -> Value {
    let walk = Walk {
        previous_taken_at: previous.map(|p| p.taken_at),
        sleep: sleep_seconds(payload),
        now,
    };
    explode_node(payload, previous.map(|p| p.payload), &walk)
}

/// Collapse a structured payload back to the shapes a device understands.
pub fn compact(payload: &Value) -> Value {
    match payload {
        Value::Object(map) => {
            let mut compacted = Map::new();
            for (key, child) in map {
                let value = match schema::role_of(key) {
                    KeyRole::Actions => compact_actions(child),
                    KeyRole::TimeOfDay => compact_time(child),
                    _ => compact_child(child),
                };
                compacted.insert(key.clone(), value);
            }
            Value::Object(compacted)
        }
        other => other.clone(),
    }
}

fn explode_node(value: &Value, previous: Option<&Value>, walk: &Walk) -> Value {
    let map = match value {
        Value::Object(map) => map,
        other => return other.clone(),
    };

    let mut exploded = Map::new();
    for (key, child) in map {
        let previous_child = previous.and_then(|p| p.get(key));
        match schema::role_of(key) {
            KeyRole::Actions => {
                exploded.insert(key.clone(), explode_actions(child));
            }
            KeyRole::Senses => {
                exploded.insert(key.clone(), explode_senses(child, previous_child, walk));
            }
            KeyRole::TimeOfDay => {
                let value = match child.as_i64() {
                    Some(seconds) => Value::String(seconds_to_clock(seconds)),
                    None => explode_child(child, previous_child, walk),
                };
                exploded.insert(key.clone(), value);
            }
            KeyRole::BootCounter => {
                if let Some(boot) = explode_boot(child, previous, walk) {
                    exploded.insert(schema::BOOT_KEY.to_string(), boot);
                }
            }
            KeyRole::Plain => {
                exploded.insert(key.clone(), explode_child(child, previous_child, walk));
            }
        }
    }
    Value::Object(exploded)
}

fn explode_child(child: &Value, previous: Option<&Value>, walk: &Walk) -> Value {
    if child.is_object() {
        explode_node(child, previous.filter(|p| p.is_object()), walk)
    } else {
        child.clone()
    }
}

fn explode_actions(actions: &Value) -> Value {
    match actions {
        Value::Array(rules) => Value::Array(rules.iter().map(explode_rule).collect()),
        Value::Object(map) => match explode_legacy_actions(map) {
            Some(rules) => rules,
            None => actions.clone(),
        },
        other => {
            warn!("Actions is neither a rule list nor a legacy mapping: {}", other);
            other.clone()
        }
    }
}

fn explode_rule(raw: &Value) -> Value {
    let wire = match raw.as_str() {
        Some(wire) => wire,
        None => {
            warn!("Action rule is not a string, passing it through: {}", raw);
            return raw.clone();
        }
    };
    match ActionRule::parse(wire).map(|rule| serde_json::to_value(&rule)) {
        Ok(Ok(rule)) => rule,
        Ok(Err(e)) => {
            warn!("Could not serialize action rule {}: {}", wire, e);
            raw.clone()
        }
        Err(e) => {
            warn!("{}, passing the rule through unchanged", e);
            raw.clone()
        }
    }
}

/// Decode a whole legacy `key: threshold~delta` mapping into a rule list.
/// Any entry that fails keeps the entire mapping unchanged, so a document
/// never ends up half-converted.
fn explode_legacy_actions(map: &Map<String, Value>) -> Option<Value> {
    let mut rules = Vec::with_capacity(map.len());
    for (key, value) in map {
        let value = match value.as_str() {
            Some(value) => value,
            None => {
                warn!("Legacy action value for {} is not a string, keeping the mapping", key);
                return None;
            }
        };
        match ActionRule::parse_legacy(key, value) {
            Ok(rule) => match serde_json::to_value(&rule) {
                Ok(rule) => rules.push(rule),
                Err(_) => return None,
            },
            Err(e) => {
                warn!("{}, keeping the legacy actions mapping unchanged", e);
                return None;
            }
        }
    }
    Some(Value::Array(rules))
}

fn explode_senses(senses: &Value, previous: Option<&Value>, walk: &Walk) -> Value {
    let map = match senses {
        Value::Object(map) => map,
        other => {
            warn!("Senses is not a mapping: {}", other);
            return other.clone();
        }
    };

    let mut exploded = Map::new();
    for (sense, raw) in map {
        if schema::role_of(sense) == KeyRole::TimeOfDay {
            if let Some(seconds) = raw.as_i64() {
                exploded.insert(sense.clone(), Value::String(seconds_to_clock(seconds)));
                continue;
            }
        }

        let value = match SenseReading::parse(raw) {
            Some(reading) => {
                let fresh = reading.has_fresh_value();
                let carry = match (previous.and_then(|p| p.get(sense)), walk.previous_taken_at) {
                    (Some(prev), Some(taken_at)) => PreviousReading::from_exploded(prev, taken_at),
                    _ => None,
                };
                let structured = reading.into_value(carry.as_ref(), walk.now);
                if fresh && schema::is_capacitive_humidity(sense) {
                    normalize_capacitive_humidity(structured)
                } else {
                    structured
                }
            }
            None => {
                debug!("Reading for {} matches no known form, passing it through", sense);
                raw.clone()
            }
        };
        exploded.insert(sense.clone(), value);
    }
    Value::Object(exploded)
}

/// Turn a seconds-since-boot counter into an absolute boot timestamp,
/// keeping the previously recorded one when the difference is explained by
/// clock jitter or by a completed sleep interval.
fn explode_boot(counter: &Value, previous: Option<&Value>, walk: &Walk) -> Option<Value> {
    let previous_boot = previous
        .and_then(|p| p.get(schema::BOOT_KEY))
        .and_then(Value::as_str)
        .and_then(|raw| parse_timestamp(raw).ok());

    let seconds = match counter.as_i64() {
        Some(seconds) => seconds,
        None => {
            warn!("Boot counter is not an integer: {}", counter);
            return previous_boot.map(|at| Value::String(format_timestamp(at)));
        }
    };

    if seconds < 0 {
        debug!("Device clock not synchronized yet (b = {}), keeping previous boot", seconds);
        return previous_boot.map(|at| Value::String(format_timestamp(at)));
    }

    let candidate = walk.now - Duration::seconds(seconds);
    if let Some(previous_boot) = previous_boot {
        let elapsed = candidate.signed_duration_since(previous_boot).num_seconds();
        if elapsed.abs() <= BOOT_CLOCK_JITTER_SECS {
            return Some(Value::String(format_timestamp(previous_boot)));
        }
        if let Some(sleep) = walk.sleep.filter(|s| *s > 0) {
            if elapsed >= sleep - BOOT_CLOCK_JITTER_SECS && elapsed <= sleep + TYPICAL_AWAKE_SECS {
                debug!(
                    "Boot estimate moved by one sleep cycle ({}s), keeping previous boot",
                    elapsed
                );
                return Some(Value::String(format_timestamp(previous_boot)));
            }
        }
    }
    Some(Value::String(format_timestamp(candidate)))
}

fn compact_child(child: &Value) -> Value {
    if child.is_object() {
        compact(child)
    } else {
        child.clone()
    }
}

fn compact_time(child: &Value) -> Value {
    match child.as_str() {
        Some(clock) => match clock_to_seconds(clock) {
            Ok(seconds) => Value::Number(seconds.into()),
            Err(e) => {
                warn!("{}, passing the time value through unchanged", e);
                child.clone()
            }
        },
        None => compact_child(child),
    }
}

fn compact_actions(actions: &Value) -> Value {
    match actions {
        Value::Array(rules) => Value::Array(rules.iter().map(compact_rule).collect()),
        Value::Object(_) => {
            debug!("Legacy actions mapping is never re-encoded, passing it through");
            actions.clone()
        }
        other => {
            warn!("Actions is neither a rule list nor a legacy mapping: {}", other);
            other.clone()
        }
    }
}

fn compact_rule(structured: &Value) -> Value {
    if structured.is_string() {
        // Already in wire form.
        return structured.clone();
    }
    let rule: ActionRule = match serde_json::from_value(structured.clone()) {
        Ok(rule) => rule,
        Err(_) => {
            warn!(
                "Action rule does not have all the required attributes, passing it through: {}",
                structured
            );
            return structured.clone();
        }
    };
    match rule.to_wire() {
        Ok(wire) => Value::String(wire),
        Err(e) => {
            warn!("{}, passing the rule through unchanged", e);
            structured.clone()
        }
    }
}

/// Sleep interval a payload configures, in seconds. Devices report it as
/// either a number or a numeric string.
fn sleep_seconds(payload: &Value) -> Option<i64> {
    let sleep = payload.get("config").and_then(|config| config.get("sleep"))?;
    integer_value(sleep)
}

fn integer_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
