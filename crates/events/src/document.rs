//! Dotted-path access and value comparison over JSON documents.
//!
//! Paths use `.` as separator (`fullDocument.amount`). A segment that parses
//! as an unsigned integer indexes into an array.

use core::cmp::Ordering;

use serde_json::{Map, Value as JsonValue};

/// Look up the value at `path`.
pub fn get_path<'a>(document: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let mut current = document;
    for segment in path.split('.') {
        current = match current {
            JsonValue::Object(map) => map.get(segment)?,
            JsonValue::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Set the value at `path`, creating intermediate objects as needed.
///
/// Returns `false` when an intermediate segment exists but is not an object.
pub fn set_path(document: &mut JsonValue, path: &str, value: JsonValue) -> bool {
    let (parent, leaf) = match path.rsplit_once('.') {
        Some((parent, leaf)) => (Some(parent), leaf),
        None => (None, path),
    };

    let mut current = document;
    for segment in parent.into_iter().flat_map(|p| p.split('.')) {
        if current.is_null() {
            *current = JsonValue::Object(Map::new());
        }
        current = match current {
            JsonValue::Object(map) => map
                .entry(segment.to_string())
                .or_insert_with(|| JsonValue::Object(Map::new())),
            _ => return false,
        };
    }

    if current.is_null() {
        *current = JsonValue::Object(Map::new());
    }
    match current {
        JsonValue::Object(map) => {
            map.insert(leaf.to_string(), value);
            true
        }
        _ => false,
    }
}

/// Remove the value at `path`, returning it if present.
pub fn remove_path(document: &mut JsonValue, path: &str) -> Option<JsonValue> {
    match path.rsplit_once('.') {
        None => document.as_object_mut()?.remove(path),
        Some((parent, leaf)) => {
            let mut current = document;
            for segment in parent.split('.') {
                current = current.as_object_mut()?.get_mut(segment)?;
            }
            current.as_object_mut()?.remove(leaf)
        }
    }
}

/// Order two scalar values.
///
/// Numbers compare numerically, strings lexicographically, booleans
/// `false < true`. A string that parses as a number compares numerically
/// against a number. Any other pairing is unordered.
pub fn compare_values(left: &JsonValue, right: &JsonValue) -> Option<Ordering> {
    match (left, right) {
        (JsonValue::Number(a), JsonValue::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (JsonValue::String(a), JsonValue::String(b)) => Some(a.cmp(b)),
        (JsonValue::Bool(a), JsonValue::Bool(b)) => Some(a.cmp(b)),
        (JsonValue::Null, JsonValue::Null) => Some(Ordering::Equal),
        (JsonValue::String(s), JsonValue::Number(n)) => numeric(s)?.partial_cmp(&n.as_f64()?),
        (JsonValue::Number(n), JsonValue::String(s)) => n.as_f64()?.partial_cmp(&numeric(s)?),
        _ => None,
    }
}

/// Equality used by filters: numbers by value, everything else structurally.
///
/// Unlike [`compare_values`], a numeric string never equals a number.
pub fn values_equal(left: &JsonValue, right: &JsonValue) -> bool {
    match (left, right) {
        (JsonValue::Number(a), JsonValue::Number(b)) => {
            matches!((a.as_f64(), b.as_f64()), (Some(a), Some(b)) if a == b)
        }
        _ => left == right,
    }
}

fn numeric(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|f| f.is_finite())
}
