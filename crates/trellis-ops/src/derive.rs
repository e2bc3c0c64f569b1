//! Deriving display values from raw readings.
//!
//! Devices report what their ADCs measured; dashboards want percentages and
//! compensated values. The sweep walks every thing with fresh readings,
//! applies the per-sense formulas from its `formulas` axis and writes the
//! result to the `derived` axis. The derived document is a copy of the
//! reported one with the computed senses added alongside the raw ones,
//! under the same timestamp, so a derived snapshot is always attributable
//! to one report.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use trellis_codec::is_analog;
use trellis_store::{ShadowStore, StateDocument, DERIVED, FORMULAS, REPORTED};

use crate::error::Result;
use crate::sweep::Sweep;

/// Applies derivation formulas to freshly reported readings.
pub struct DeriveSweep {
    store: Arc<ShadowStore>,
}

impl DeriveSweep {
    pub fn new(store: Arc<ShadowStore>) -> Self {
        Self { store }
    }

    /// Derive one thing's readings, seeding default formulas on first run.
    pub fn derive_thing(&self, thing: &str) -> Result<()> {
        let reported = match self.store.get(thing, REPORTED)? {
            Some(reported) => reported,
            None => {
                debug!("Nothing reported yet for {}; nothing to derive", thing);
                return Ok(());
            }
        };

        let formulas = match self.store.get(thing, FORMULAS)? {
            Some(doc) => doc.state,
            None => {
                let seed = default_formulas(&reported.state);
                info!("Seeding default formulas for {}", thing);
                self.store.put(thing, FORMULAS, &seed)?;
                seed
            }
        };

        let derived = self.apply_formulas(&reported, &formulas);
        self.store.write_snapshot(thing, DERIVED, &derived)?;
        Ok(())
    }

    fn apply_formulas(&self, reported: &StateDocument, formulas: &Value) -> StateDocument {
        let mut derived = reported.clone();

        let formulas = match formulas.as_object() {
            Some(map) if !map.is_empty() => map,
            _ => return derived,
        };
        if !has_senses(&derived.state) {
            return derived;
        }

        // A formula may read another formula's output (a decorrelation over
        // an already scaled sense), so keep passing over the ones that did
        // not resolve until a pass applies nothing new.
        let mut pending: Vec<(&String, &Value)> = formulas.iter().collect();
        loop {
            let before = pending.len();
            let mut unresolved = Vec::new();
            for (sense, formula) in pending {
                let computed = derived
                    .state
                    .get("senses")
                    .and_then(Value::as_object)
                    .and_then(|senses| self.apply_formula(sense, formula, senses));
                match computed {
                    Some(value) => {
                        if let Some(senses) =
                            derived.state.get_mut("senses").and_then(Value::as_object_mut)
                        {
                            senses.insert(sense.clone(), value);
                        }
                    }
                    None => unresolved.push((sense, formula)),
                }
            }
            if unresolved.is_empty() || unresolved.len() == before {
                break;
            }
            pending = unresolved;
        }
        derived
    }

    fn apply_formula(
        &self,
        sense: &str,
        formula: &Value,
        senses: &Map<String, Value>,
    ) -> Option<Value> {
        let kind = match formula.get("formula").and_then(Value::as_str) {
            Some(kind) => kind,
            None => {
                warn!("Formula for {} names no kind: {}", sense, formula);
                return None;
            }
        };
        let reading = self.source_value(formula.get("from")?.as_str()?, senses)?;

        match kind {
            "scale" => {
                let from_low = formula.get("from_low")?.as_f64()?;
                let from_high = formula.get("from_high")?.as_f64()?;
                let to_low = formula.get("to_low")?.as_f64()?;
                let to_high = formula.get("to_high")?.as_f64()?;
                number(scale(reading, from_low, from_high, to_low, to_high))
            }
            "decorrelate" => {
                let correlated = self.source_value(formula.get("correlated")?.as_str()?, senses)?;
                let adjustment = formula.get("adjustment")?.as_f64()?;
                let scale = formula.get("scale")?.as_f64()?;
                number(reading - (correlated + adjustment) * scale)
            }
            other => {
                warn!("Unknown formula kind {} for {}", other, sense);
                None
            }
        }
    }

    /// Resolve a formula source, either a local sense or `thing:sense` in
    /// another thing's reported state.
    fn source_value(&self, source: &str, senses: &Map<String, Value>) -> Option<f64> {
        if let Some((thing, sense)) = source.split_once(':') {
            let reported = match self.store.get(thing, REPORTED) {
                Ok(Some(reported)) => reported,
                Ok(None) => {
                    debug!("Correlated thing {} has not reported yet", thing);
                    return None;
                }
                Err(e) => {
                    warn!("Reading correlated thing {} failed: {}", thing, e);
                    return None;
                }
            };
            return numeric_value(reported.state.get("senses")?.get(sense)?);
        }
        numeric_value(senses.get(source)?)
    }
}

#[async_trait]
impl Sweep for DeriveSweep {
    fn name(&self) -> &str {
        "derive"
    }

    async fn run(&self) -> Result<()> {
        for thing in self.store.things()? {
            let pending = match self.store.take_derive_pending(&thing) {
                Ok(pending) => pending,
                Err(e) => {
                    warn!("Checking for fresh readings of {} failed: {}", thing, e);
                    continue;
                }
            };
            if !pending {
                continue;
            }
            info!("Deriving readings for {}", thing);
            if let Err(e) = self.derive_thing(&thing) {
                warn!("Deriving readings for {} failed: {}", thing, e);
            }
        }
        Ok(())
    }
}

/// Default formulas for a first-seen thing: every analog sense gets a
/// `<sense>-percent` companion, the full 10-bit ADC range mapped to percent.
fn default_formulas(state: &Value) -> Value {
    let mut formulas = Map::new();
    if let Some(senses) = state.get("senses").and_then(Value::as_object) {
        for sense in senses.keys().filter(|sense| is_analog(sense)) {
            formulas.insert(
                format!("{}-percent", sense),
                json!({
                    "formula": "scale",
                    "from": sense,
                    "from_low": 0,
                    "from_high": 1024,
                    "to_low": 0,
                    "to_high": 100,
                }),
            );
        }
    }
    Value::Object(formulas)
}

fn has_senses(state: &Value) -> bool {
    state
        .get("senses")
        .and_then(Value::as_object)
        .map(|senses| !senses.is_empty())
        .unwrap_or(false)
}

fn scale(value: f64, from_low: f64, from_high: f64, to_low: f64, to_high: f64) -> f64 {
    (value - from_low) / (from_high - from_low) * (to_high - to_low) + to_low
}

/// A reading contributes its bare number, or its `value`, or failing that
/// the `expected` it was checked against.
fn numeric_value(reading: &Value) -> Option<f64> {
    match reading {
        Value::Number(number) => number.as_f64(),
        Value::Object(map) => map
            .get("value")
            .or_else(|| map.get("expected"))?
            .as_f64(),
        _ => None,
    }
}

fn number(value: f64) -> Option<Value> {
    serde_json::Number::from_f64(value).map(Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sweep() -> (tempfile::TempDir, DeriveSweep, Arc<ShadowStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ShadowStore::open(dir.path().join("things")).unwrap());
        (dir, DeriveSweep::new(store.clone()), store)
    }

    fn derived_senses(store: &ShadowStore, thing: &str) -> Value {
        store.get(thing, DERIVED).unwrap().unwrap().state["senses"].clone()
    }

    #[test]
    fn test_analog_readings_gain_a_percent_companion() {
        let (_dir, sweep, store) = sweep();
        store
            .update_reported("esp-one", &json!({"config": {}, "senses": {"I2C-8": 512}}))
            .unwrap();

        sweep.derive_thing("esp-one").unwrap();

        let senses = derived_senses(&store, "esp-one");
        assert_eq!(senses["I2C-8-percent"], json!(50.0));
        // The raw reading stays alongside the derived one.
        assert_eq!(senses["I2C-8"], json!(512));
    }

    #[test]
    fn test_first_derivation_seeds_default_formulas() {
        let (_dir, sweep, store) = sweep();
        store
            .update_reported(
                "esp-one",
                &json!({"config": {}, "senses": {"I2C-8": 512, "gpio-4": 1}}),
            )
            .unwrap();

        sweep.derive_thing("esp-one").unwrap();

        let formulas = store.get("esp-one", FORMULAS).unwrap().unwrap().state;
        assert_eq!(
            formulas["I2C-8-percent"],
            json!({
                "formula": "scale",
                "from": "I2C-8",
                "from_low": 0,
                "from_high": 1024,
                "to_low": 0,
                "to_high": 100,
            })
        );
        // Digital senses get no default formula.
        assert!(formulas.get("gpio-4-percent").is_none());
        assert_eq!(formulas.as_object().unwrap().len(), 1);
    }

    #[test]
    fn test_custom_formulas_are_never_reseeded() {
        let (_dir, sweep, store) = sweep();
        store
            .update_reported("esp-one", &json!({"config": {}, "senses": {"I2C-8": 512}}))
            .unwrap();
        let custom = json!({
            "I2C-8-scaled": {
                "formula": "scale",
                "from": "I2C-8",
                "from_low": 0.0,
                "from_high": 1024.0,
                "to_low": 0.0,
                "to_high": 10.0,
            }
        });
        store.put("esp-one", FORMULAS, &custom).unwrap();

        sweep.derive_thing("esp-one").unwrap();

        assert_eq!(store.get("esp-one", FORMULAS).unwrap().unwrap().state, custom);
        let senses = derived_senses(&store, "esp-one");
        assert_eq!(senses["I2C-8-scaled"], json!(5.0));
        assert!(senses.get("I2C-8-percent").is_none());
    }

    #[test]
    fn test_decorrelate_reads_across_things() {
        let (_dir, sweep, store) = sweep();
        store
            .update_reported("esp-probe", &json!({"config": {}, "senses": {"I2C-31": 100}}))
            .unwrap();
        store
            .update_reported("esp-weather", &json!({"config": {}, "senses": {"OW-1": 20}}))
            .unwrap();
        store
            .put(
                "esp-probe",
                FORMULAS,
                &json!({
                    "I2C-31-decorrelated": {
                        "formula": "decorrelate",
                        "from": "I2C-31",
                        "correlated": "esp-weather:OW-1",
                        "adjustment": 5,
                        "scale": 2,
                    }
                }),
            )
            .unwrap();

        sweep.derive_thing("esp-probe").unwrap();

        // 100 - (20 + 5) * 2
        assert_eq!(
            derived_senses(&store, "esp-probe")["I2C-31-decorrelated"],
            json!(50.0)
        );
    }

    #[test]
    fn test_a_formula_can_read_another_formulas_output() {
        let (_dir, sweep, store) = sweep();
        store
            .update_reported(
                "esp-one",
                &json!({"config": {}, "senses": {"I2C-8": {"value": 512}, "OW-1": {"value": 35}}}),
            )
            .unwrap();
        // The decorrelation reads the scaled value, and its key sorts
        // before the scale formula's.
        store
            .put(
                "esp-one",
                FORMULAS,
                &json!({
                    "I2C-8-decorrelated": {
                        "formula": "decorrelate",
                        "from": "I2C-8-scaled",
                        "correlated": "OW-1",
                        "adjustment": -30,
                        "scale": 6,
                    },
                    "I2C-8-scaled": {
                        "formula": "scale",
                        "from": "I2C-8",
                        "from_low": 0,
                        "from_high": 1024,
                        "to_low": 0,
                        "to_high": 100,
                    },
                }),
            )
            .unwrap();

        sweep.derive_thing("esp-one").unwrap();

        let senses = derived_senses(&store, "esp-one");
        assert_eq!(senses["I2C-8-scaled"], json!(50.0));
        // 50 - (35 + -30) * 6
        assert_eq!(senses["I2C-8-decorrelated"], json!(20.0));
    }

    #[test]
    fn test_object_readings_contribute_their_value_field() {
        let (_dir, sweep, store) = sweep();
        store
            .update_reported(
                "esp-one",
                &json!({"config": {}, "senses": {"I2C-8": {"original": 560, "value": 512}}}),
            )
            .unwrap();

        sweep.derive_thing("esp-one").unwrap();

        assert_eq!(derived_senses(&store, "esp-one")["I2C-8-percent"], json!(50.0));
    }

    #[test]
    fn test_a_wrong_reading_falls_back_to_expected() {
        let (_dir, sweep, store) = sweep();
        store
            .update_reported(
                "esp-one",
                &json!({"config": {}, "senses": {"I2C-8": {"expected": 512, "wrong": true}}}),
            )
            .unwrap();

        sweep.derive_thing("esp-one").unwrap();

        assert_eq!(derived_senses(&store, "esp-one")["I2C-8-percent"], json!(50.0));
    }

    #[test]
    fn test_a_valueless_reading_derives_nothing() {
        let (_dir, sweep, store) = sweep();
        store
            .update_reported(
                "esp-one",
                &json!({"config": {}, "senses": {"I2C-8": {"ssd": 512}}}),
            )
            .unwrap();

        sweep.derive_thing("esp-one").unwrap();

        let senses = derived_senses(&store, "esp-one");
        assert!(senses.get("I2C-8-percent").is_none());
        assert_eq!(senses["I2C-8"], json!({"ssd": 512}));
    }

    #[test]
    fn test_a_zero_reading_still_derives() {
        let (_dir, sweep, store) = sweep();
        store
            .update_reported("esp-one", &json!({"config": {}, "senses": {"I2C-8": 0}}))
            .unwrap();

        sweep.derive_thing("esp-one").unwrap();

        assert_eq!(derived_senses(&store, "esp-one")["I2C-8-percent"], json!(0.0));
    }

    #[test]
    fn test_a_missing_source_leaves_the_reading_alone() {
        let (_dir, sweep, store) = sweep();
        store
            .update_reported("esp-one", &json!({"config": {}, "senses": {"gpio-4": 1}}))
            .unwrap();
        store
            .put(
                "esp-one",
                FORMULAS,
                &json!({
                    "gpio-4-scaled": {
                        "formula": "scale",
                        "from": "I2C-99",
                        "from_low": 0,
                        "from_high": 1024,
                        "to_low": 0,
                        "to_high": 100,
                    }
                }),
            )
            .unwrap();

        sweep.derive_thing("esp-one").unwrap();

        let senses = derived_senses(&store, "esp-one");
        assert_eq!(senses["gpio-4"], json!(1));
        assert!(senses.get("gpio-4-scaled").is_none());
    }

    #[test]
    fn test_derived_keeps_the_reported_timestamp() {
        let (_dir, sweep, store) = sweep();
        store
            .update_reported("esp-one", &json!({"config": {}, "senses": {"I2C-8": 512}}))
            .unwrap();

        sweep.derive_thing("esp-one").unwrap();

        let reported = store.get("esp-one", REPORTED).unwrap().unwrap();
        let derived = store.get("esp-one", DERIVED).unwrap().unwrap();
        assert_eq!(derived.timestamp_utc, reported.timestamp_utc);
        // Everything besides the computed senses is carried over.
        assert_eq!(derived.state["config"], reported.state["config"]);
    }

    #[tokio::test]
    async fn test_the_sweep_only_touches_pending_things() {
        let (_dir, sweep, store) = sweep();
        store
            .update_reported("esp-one", &json!({"config": {}, "senses": {"I2C-8": 512}}))
            .unwrap();

        sweep.run().await.unwrap();
        assert!(store.get("esp-one", DERIVED).unwrap().is_some());
        assert!(!store.take_derive_pending("esp-one").unwrap());

        // A second pass with no fresh report leaves the derived axis alone.
        let before = store.get("esp-one", DERIVED).unwrap().unwrap();
        sweep.run().await.unwrap();
        assert_eq!(store.get("esp-one", DERIVED).unwrap().unwrap(), before);
    }
}
