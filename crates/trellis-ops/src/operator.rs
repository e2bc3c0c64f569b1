//! The request/answer core of the pub/sub operator.
//!
//! The transport layer (an MQTT client, a test harness) feeds every inbound
//! message through [`Operator::answer`] and publishes whatever comes back.
//! Structurally broken traffic gets one of a small set of fixed error
//! payloads on [`ERROR_TOPIC`]; the payloads are byte-stable constants that
//! devices and humans grep for. Successful updates are silent.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{error, info, warn};

use trellis_store::{compute_delta, Error as StoreError, ShadowStore};

/// Topic that malformed or unexpected traffic is answered on.
pub const ERROR_TOPIC: &str = "operator_error";

/// Answer for traffic on a topic the operator does not serve.
pub const MESSAGE_NOT_HANDLED: &str =
    r#"{"reason": "Message not handled. See operator logs for details"}"#;
/// Answer for a payload that does not parse as JSON.
pub const MESSAGE_NOT_JSON: &str =
    r#"{"reason": "Message not a valid json. See operator logs for details"}"#;
/// Answer for an update without a `state` wrapper.
pub const WRONG_FORMAT_STATE: &str =
    r#"{"reason": "Message payload did not begin with state object. See operator logs for details"}"#;
/// Answer for an update whose `state` carries no usable axis object.
pub const WRONG_FORMAT_REPORTED_DESIRED: &str =
    r#"{"reason": "Message payload did not begin with state/reported or state/desired objects. See operator logs for details"}"#;
/// Answer for a delta request that failed for reasons other than format.
pub const DELTA_FAILED: &str =
    r#"{"reason": "Could not compute delta. See operator logs for details"}"#;

/// One message to publish back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub topic: String,
    pub payload: String,
}

impl Answer {
    fn error(payload: impl Into<String>) -> Self {
        Self {
            topic: ERROR_TOPIC.to_string(),
            payload: payload.into(),
        }
    }
}

/// Answers `things/<thing>/update` and `things/<thing>/get` traffic against
/// a shadow store.
pub struct Operator {
    store: Arc<ShadowStore>,
}

impl Operator {
    pub fn new(store: Arc<ShadowStore>) -> Self {
        Self { store }
    }

    /// Answer one inbound message. `None` means there is nothing to publish.
    pub fn answer(&self, topic: &str, payload: &str) -> Option<Answer> {
        let message: Value = match serde_json::from_str(payload) {
            Ok(message) => message,
            Err(e) => {
                error!("Payload is not a valid json. {} - {}: {}", topic, payload, e);
                return Some(Answer::error(MESSAGE_NOT_JSON));
            }
        };

        match parse_thing_verb(topic) {
            Some((thing, "update")) => self.answer_update(thing, &message, topic),
            Some((thing, "get")) => Some(self.answer_get(thing)),
            _ => {
                error!("Message on an unexpected topic: {} - {}", topic, message);
                Some(Answer::error(MESSAGE_NOT_HANDLED))
            }
        }
    }

    fn answer_update(&self, thing: &str, message: &Value, topic: &str) -> Option<Answer> {
        let state = match message.get("state") {
            Some(state) if is_filled_object(state) => state,
            _ => {
                error!(
                    "Update payload does not begin with a state object. {} - {}",
                    topic, message
                );
                return Some(Answer::error(WRONG_FORMAT_STATE));
            }
        };

        let reported = match state.get("reported") {
            Some(reported) if is_filled_object(reported) => reported,
            _ => {
                error!("Update does not contain reported. {} - {}", topic, message);
                return Some(Answer::error(WRONG_FORMAT_REPORTED_DESIRED));
            }
        };

        match self.store.update_reported(thing, reported) {
            Ok(()) => {
                info!("Updated reported state of {}", thing);
                None
            }
            Err(e) => {
                error!("Updating reported for {} failed: {}", thing, e);
                Some(Answer::error(update_reported_failed(&e)))
            }
        }
    }

    /// The payload of a `get` is ignored; it is just a request for a delta.
    fn answer_get(&self, thing: &str) -> Answer {
        let topic = delta_topic(thing);
        let delta = match compute_delta(&self.store, thing) {
            Ok(delta) => delta,
            Err(StoreError::MissingConfig(thing)) => {
                error!("Cannot compute a delta: {} never reported a config", thing);
                return Answer {
                    topic,
                    payload: stamp(json!({"error": 1})),
                };
            }
            Err(StoreError::NoSuchThing(thing)) => {
                warn!("Delta requested for unknown thing {}", thing);
                Value::Object(Map::new())
            }
            Err(e) => {
                error!("Computing the delta for {} failed: {}", thing, e);
                return Answer::error(DELTA_FAILED);
            }
        };
        Answer {
            topic,
            payload: stamp(delta),
        }
    }
}

fn delta_topic(thing: &str) -> String {
    format!("things/{}/delta", thing)
}

/// Split `things/<thing>/<verb>` into its parts.
fn parse_thing_verb(topic: &str) -> Option<(&str, &str)> {
    let rest = topic.strip_prefix("things/")?;
    let (thing, verb) = rest.split_once('/')?;
    let thing_ok = !thing.is_empty()
        && thing.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    let verb_ok = !verb.is_empty()
        && verb.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if thing_ok && verb_ok {
        Some((thing, verb))
    } else {
        None
    }
}

fn is_filled_object(value: &Value) -> bool {
    value.as_object().map(|map| !map.is_empty()).unwrap_or(false)
}

/// Stamp an answer payload with `t`, the current Unix seconds. Devices use
/// it for boot-time arithmetic, so every delta answer carries one.
fn stamp(mut delta: Value) -> String {
    if let Value::Object(map) = &mut delta {
        map.insert("t".to_string(), Value::from(Utc::now().timestamp()));
    }
    delta.to_string()
}

fn update_reported_failed(cause: &StoreError) -> String {
    json!({
        "reason": format!(
            "Updating reported failed: {}. See operator logs for details",
            cause
        )
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trellis_store::{DESIRED, REPORTED};

    fn operator() -> (tempfile::TempDir, Operator, Arc<ShadowStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ShadowStore::open(dir.path().join("things")).unwrap());
        (dir, Operator::new(store.clone()), store)
    }

    #[test]
    fn a_valid_update_is_applied_silently() {
        let (_dir, operator, store) = operator();
        let answer = operator.answer(
            "things/esp-a4cf12/update",
            r#"{"state": {"reported": {"config": {"sleep": "60"}}}}"#,
        );
        assert_eq!(answer, None);
        assert_eq!(
            store.get("esp-a4cf12", REPORTED).unwrap().unwrap().state,
            json!({"config": {"sleep": "60"}})
        );
    }

    #[test]
    fn junk_payloads_answer_not_json() {
        let (_dir, operator, _store) = operator();
        for payload in ["not json", "", "{truncated"] {
            let answer = operator.answer("things/esp-a4cf12/update", payload).unwrap();
            assert_eq!(answer.topic, ERROR_TOPIC);
            assert_eq!(answer.payload, MESSAGE_NOT_JSON);
        }
    }

    #[test]
    fn an_update_without_state_is_refused() {
        let (_dir, operator, _store) = operator();
        for payload in [r#"{}"#, r#"{"state": {}}"#, r#"{"state": 5}"#, r#"{"other": 1}"#] {
            let answer = operator.answer("things/esp-a4cf12/update", payload).unwrap();
            assert_eq!(answer.topic, ERROR_TOPIC);
            assert_eq!(answer.payload, WRONG_FORMAT_STATE);
        }
    }

    #[test]
    fn an_update_without_reported_is_refused() {
        let (_dir, operator, _store) = operator();
        for payload in [
            r#"{"state": {"desired": {"sleep": "60"}}}"#,
            r#"{"state": {"reported": {}}}"#,
            r#"{"state": {"reported": 5}}"#,
        ] {
            let answer = operator.answer("things/esp-a4cf12/update", payload).unwrap();
            assert_eq!(answer.topic, ERROR_TOPIC);
            assert_eq!(answer.payload, WRONG_FORMAT_REPORTED_DESIRED);
        }
    }

    #[test]
    fn a_failing_update_reports_its_cause() {
        let (_dir, operator, _store) = operator();
        // The state wrapper is reserved; the store refuses to nest it.
        let answer = operator
            .answer(
                "things/esp-a4cf12/update",
                r#"{"state": {"reported": {"state": {"v": 1}}}}"#,
            )
            .unwrap();
        assert_eq!(answer.topic, ERROR_TOPIC);
        let payload: Value = serde_json::from_str(&answer.payload).unwrap();
        let reason = payload["reason"].as_str().unwrap();
        assert!(reason.starts_with("Updating reported failed:"));
        assert!(reason.ends_with("See operator logs for details"));
    }

    #[test]
    fn unknown_topics_answer_not_handled() {
        let (_dir, operator, _store) = operator();
        for topic in [
            "things/esp-a4cf12/destroy",
            "things//get",
            "things/bad%name/get",
            "elsewhere/esp-a4cf12/get",
            "things/esp-a4cf12",
        ] {
            let answer = operator.answer(topic, "{}").unwrap();
            assert_eq!(answer.topic, ERROR_TOPIC);
            assert_eq!(answer.payload, MESSAGE_NOT_HANDLED);
        }
    }

    #[test]
    fn a_get_answers_the_delta_with_a_timestamp() {
        let (_dir, operator, store) = operator();
        store
            .update_reported("esp-a4cf12", &json!({"config": {"sleep": "1"}}))
            .unwrap();
        store
            .update_desired("esp-a4cf12", &json!({"sleep": "2"}))
            .unwrap();

        let answer = operator.answer("things/esp-a4cf12/get", "{}").unwrap();
        assert_eq!(answer.topic, "things/esp-a4cf12/delta");

        let payload: Value = serde_json::from_str(&answer.payload).unwrap();
        assert_eq!(payload["sleep"], json!("2"));
        assert!(payload["t"].is_i64());
    }

    #[test]
    fn a_converged_get_answers_only_the_timestamp() {
        let (_dir, operator, store) = operator();
        store
            .update_reported("esp-a4cf12", &json!({"config": {"sleep": "1"}}))
            .unwrap();

        let answer = operator.answer("things/esp-a4cf12/get", "{}").unwrap();
        let payload: Value = serde_json::from_str(&answer.payload).unwrap();
        let map = payload.as_object().unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("t"));
    }

    #[test]
    fn a_get_without_reported_config_answers_the_error_marker() {
        let (_dir, operator, store) = operator();
        store
            .update_reported("esp-a4cf12", &json!({"senses": {"I2C-9": 1}}))
            .unwrap();

        let answer = operator.answer("things/esp-a4cf12/get", "{}").unwrap();
        assert_eq!(answer.topic, "things/esp-a4cf12/delta");
        let payload: Value = serde_json::from_str(&answer.payload).unwrap();
        assert_eq!(payload["error"], json!(1));
        assert!(payload["t"].is_i64());
    }

    #[test]
    fn a_get_for_an_unknown_thing_answers_an_empty_delta() {
        let (_dir, operator, _store) = operator();
        let answer = operator.answer("things/ghost/get", "{}").unwrap();
        assert_eq!(answer.topic, "things/ghost/delta");
        let payload: Value = serde_json::from_str(&answer.payload).unwrap();
        let map = payload.as_object().unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("t"));
    }

    #[test]
    fn updates_through_an_alias_reach_the_canonical_thing() {
        let (_dir, operator, store) = operator();
        store
            .update_reported("esp-a4cf12", &json!({"config": {"sleep": "1"}}))
            .unwrap();
        store.rename_thing("esp-a4cf12", "greenhouse").unwrap();

        let answer = operator.answer(
            "things/greenhouse/update",
            r#"{"state": {"reported": {"config": {"sleep": "5"}}}}"#,
        );
        assert_eq!(answer, None);
        assert_eq!(
            store.get("esp-a4cf12", REPORTED).unwrap().unwrap().state["config"]["sleep"],
            json!("5")
        );
        // No phantom thing was created under the alias name.
        assert_eq!(store.things().unwrap(), vec!["esp-a4cf12".to_string()]);
    }

    #[test]
    fn the_error_payloads_are_stable() {
        // Devices and dashboards match on these exact strings.
        assert_eq!(
            MESSAGE_NOT_JSON,
            r#"{"reason": "Message not a valid json. See operator logs for details"}"#
        );
        for payload in [
            MESSAGE_NOT_HANDLED,
            MESSAGE_NOT_JSON,
            WRONG_FORMAT_STATE,
            WRONG_FORMAT_REPORTED_DESIRED,
            DELTA_FAILED,
        ] {
            let parsed: Value = serde_json::from_str(payload).unwrap();
            assert!(parsed["reason"].is_string());
        }
    }

    #[test]
    fn first_contact_through_the_operator_seeds_desired() {
        let (_dir, operator, store) = operator();
        let answer = operator.answer(
            "things/esp-b00512/update",
            r#"{"state": {"reported": {"config": {"value": "1"}}}}"#,
        );
        assert_eq!(answer, None);
        assert_eq!(
            store.get("esp-b00512", DESIRED).unwrap().unwrap().state,
            json!({"value": "1"})
        );
    }
}
