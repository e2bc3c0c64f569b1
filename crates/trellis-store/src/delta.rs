//! Reconciliation of reported configuration against desired state.
//!
//! Both sides are de-aliased and compacted to the wire form before
//! comparison, so decorations and equivalent spellings of the same
//! configuration never produce a delta. The delta carries only what the
//! device must change: additions and differing values, reassembled into
//! the nested shape the device expects. Deltas never delete.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::debug;

use trellis_codec::compact;

use crate::error::{Error, Result};
use crate::shadow::{ShadowStore, DESIRED, REPORTED};

/// Key whose subtree is replaced wholesale rather than patched. The wire
/// form of action rules is an unordered set of strings, so a device cannot
/// apply a single-rule edit.
const ATOMIC_KEY: &str = "actions";

/// Compute the delta a thing must apply to converge on its desired
/// configuration. An empty object means it is already converged.
pub fn compute_delta(store: &ShadowStore, thing: &str) -> Result<Value> {
    let canonical = store.resolve(thing)?;

    let reported = store
        .get(&canonical, REPORTED)?
        .ok_or_else(|| Error::MissingConfig(canonical.clone()))?;
    let config = reported
        .state
        .get("config")
        .ok_or_else(|| Error::MissingConfig(canonical.clone()))?;

    let desired = match store.get(&canonical, DESIRED)? {
        Some(document) => document.state,
        None => return Ok(Value::Object(Map::new())),
    };
    let desired_empty = match &desired {
        Value::Object(map) => map.is_empty(),
        Value::Null => true,
        _ => false,
    };
    if desired_empty {
        return Ok(Value::Object(Map::new()));
    }

    let reported_config = compact(&dealias(config));
    let desired_config = compact(&dealias(&desired));

    let mut entries = BTreeMap::new();
    diff(&reported_config, &desired_config, &mut Vec::new(), &mut entries);
    let entries = widen_atomic(entries, &desired_config);

    Ok(reassemble(entries))
}

/// Strip alias decorations: a mapping carrying both `value` and `alias`
/// collapses to its (recursively de-aliased) value.
pub fn dealias(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            if map.contains_key("alias") {
                if let Some(inner) = map.get("value") {
                    return dealias(inner);
                }
            }
            Value::Object(
                map.iter()
                    .map(|(key, child)| (key.clone(), dealias(child)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(dealias).collect()),
        other => other.clone(),
    }
}

/// Walk desired, collecting paths that are missing from reported or hold a
/// different value. Arrays compare as opaque values. Keys only present in
/// reported are logged and dropped.
fn diff(
    reported: &Value,
    desired: &Value,
    path: &mut Vec<String>,
    entries: &mut BTreeMap<Vec<String>, Value>,
) {
    match (reported, desired) {
        (Value::Object(reported_map), Value::Object(desired_map)) => {
            for (key, desired_child) in desired_map {
                match reported_map.get(key) {
                    Some(reported_child) => {
                        path.push(key.clone());
                        diff(reported_child, desired_child, path, entries);
                        path.pop();
                    }
                    None => {
                        let mut full = path.clone();
                        full.push(key.clone());
                        entries.insert(full, desired_child.clone());
                    }
                }
            }
            for key in reported_map.keys() {
                if !desired_map.contains_key(key) {
                    debug!(
                        "Field {} exists only in reported state, deltas never delete",
                        join_path(path, key)
                    );
                }
            }
        }
        _ => {
            if reported != desired {
                entries.insert(path.clone(), desired.clone());
            }
        }
    }
}

/// Replace any entry below an `actions` key with the whole desired-side
/// value at that key.
fn widen_atomic(
    entries: BTreeMap<Vec<String>, Value>,
    desired: &Value,
) -> BTreeMap<Vec<String>, Value> {
    let mut widened = BTreeMap::new();
    for (path, value) in entries {
        match path.iter().position(|part| part == ATOMIC_KEY) {
            Some(index) if index + 1 < path.len() => {
                let prefix = path[..=index].to_vec();
                match value_at(desired, &prefix) {
                    Some(whole) => {
                        debug!(
                            "Widening delta below {} to the whole value",
                            prefix.join(".")
                        );
                        widened.insert(prefix, whole.clone());
                    }
                    None => {
                        widened.insert(path, value);
                    }
                }
            }
            _ => {
                widened.insert(path, value);
            }
        }
    }
    widened
}

fn value_at<'a>(root: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut current = root;
    for part in path {
        current = current.get(part)?;
    }
    Some(current)
}

fn reassemble(entries: BTreeMap<Vec<String>, Value>) -> Value {
    let mut root = Map::new();
    for (path, value) in entries {
        if path.is_empty() {
            // The whole document differs in shape; send desired as-is.
            return value;
        }
        insert_at(&mut root, &path, value);
    }
    Value::Object(root)
}

fn insert_at(root: &mut Map<String, Value>, path: &[String], value: Value) {
    let mut current = root;
    for part in &path[..path.len() - 1] {
        let slot = current
            .entry(part.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        current = match slot {
            Value::Object(map) => map,
            // Paths from a tree diff are disjoint, so this never collides.
            _ => return,
        };
    }
    current.insert(path[path.len() - 1].clone(), value);
}

fn join_path(path: &[String], key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path.join("."), key)
    }
}
