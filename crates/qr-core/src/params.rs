//! # Parameter maps
//!
//! Records are heterogeneous property bags: string field names mapped to
//! scalar, list, or nested-map values. The dotted-path helpers here are
//! shared by the record store's reference indexes, the `collects` projection
//! stage, and the response shapers.

use serde_json::Map;

pub type Value = serde_json::Value;

/// A single record-shaped map.
pub type Parameter = Map<String, Value>;

/// A list of records.
pub type Parameters = Vec<Parameter>;

// =============================================================================
// Dotted-path access
// =============================================================================

/// Pull the value at a (possibly dotted) path out of a record.
///
/// `pull_path(rec, "address.state")` walks nested maps; a missing segment
/// or a non-map intermediate yields `None`. The value is returned by clone
/// so callers never alias stored state.
pub fn pull_path(rec: &Parameter, path: &str) -> Option<Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = rec.get(first)?;

    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }

    Some(current.clone())
}

/// Place a value at a (possibly dotted) path inside a record, creating the
/// intermediate maps as needed. An existing non-map intermediate is replaced.
pub fn place_path(rec: &mut Parameter, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = rec;

    for segment in &segments[..segments.len() - 1] {
        let slot = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        current = slot.as_object_mut().unwrap();
    }

    current.insert(segments[segments.len() - 1].to_string(), value);
}

// =============================================================================
// Merge
// =============================================================================

/// Merge the incoming record into the destination, field by field.
///
/// - a field the destination lacks is taken as-is;
/// - two nested maps merge recursively;
/// - matching or convertible value types overwrite (with conversion);
/// - a type mismatch leaves the destination field untouched.
pub fn merge_maps(dest: &mut Parameter, incoming: &Parameter) {
    for (field, value) in incoming {
        match dest.get_mut(field) {
            None => {
                dest.insert(field.clone(), value.clone());
            }
            Some(Value::Object(existing)) => {
                if let Value::Object(nested) = value {
                    merge_maps(existing, nested);
                }
                // non-map into map: mismatch, keep the destination
            }
            Some(existing) => {
                if let Some(converted) = coerce_like(existing, value) {
                    *existing = converted;
                }
            }
        }
    }
}

/// Convert the incoming value to the destination's shape if the types match
/// or are convertible. `None` means mismatch (caller keeps the destination).
fn coerce_like(dest: &Value, incoming: &Value) -> Option<Value> {
    match (dest, incoming) {
        (Value::Null, v) => Some(v.clone()),
        (Value::String(_), Value::String(_)) => Some(incoming.clone()),
        (Value::Number(_), Value::Number(_)) => Some(incoming.clone()),
        (Value::Bool(_), Value::Bool(_)) => Some(incoming.clone()),
        (Value::Array(_), Value::Array(_)) => Some(incoming.clone()),
        // a string that parses as a number may replace a number
        (Value::Number(_), Value::String(s)) => {
            s.parse::<f64>().ok().and_then(|_| {
                serde_json::from_str::<Value>(s).ok().filter(Value::is_number)
            })
        }
        // any scalar may replace a string, stringified
        (Value::String(_), Value::Number(n)) => Some(Value::String(n.to_string())),
        (Value::String(_), Value::Bool(b)) => Some(Value::String(b.to_string())),
        _ => None,
    }
}

// =============================================================================
// Canonical string form
// =============================================================================

/// The canonical string form of a value, used for untyped comparisons and
/// for addressing records by primary key. `1` and `"1"` share a form.
pub fn canonical_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Whether a value is an acceptable primary key: string, integer, or float.
pub fn is_scalar_key(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_))
}
