//! Numeric extraction from loosely typed amd-smi JSON values.
//!
//! amd-smi reports the same reading as a bare number, as a unit-suffixed
//! string (`"41 W"`), as `"N/A"`, or not at all, depending on the device and
//! driver version. Every function here is total: failure is `None`, never a
//! panic.

use serde_json::{Map, Value};
use tracing::trace;

/// Sentinel amd-smi prints for readings the device does not support.
pub const NOT_AVAILABLE: &str = "N/A";

/// Unit suffixes stripped before parsing, checked in order.
pub const UNIT_SUFFIXES: [&str; 5] = [" W", " MHz", " %", " °C", " MB"];

/// Key under which amd-smi wraps leaf readings (`{"value": 41, "unit": "W"}`).
pub const VALUE_KEY: &str = "value";

/// Try to interpret a JSON value as a number.
///
/// Numbers are returned as-is. Strings are trimmed, checked against the
/// `"N/A"` sentinel, stripped of at most one known unit suffix and parsed.
/// Everything else yields `None`.
pub fn extract_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_reading(s),
        Value::Null | Value::Bool(_) | Value::Array(_) | Value::Object(_) => None,
    }
}

fn parse_reading(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == NOT_AVAILABLE {
        return None;
    }

    let number = UNIT_SUFFIXES
        .iter()
        .find_map(|suffix| trimmed.strip_suffix(suffix))
        .unwrap_or(trimmed);

    match number.parse::<f64>() {
        Ok(v) => Some(v),
        Err(_) => {
            trace!(value = %raw, "Could not parse reading as a number");
            None
        }
    }
}

/// Walk `path` through nested objects and extract the reading at its end.
///
/// Objects are descended into. A number met along the way is returned
/// immediately, skipping the rest of the path. Any other value ends the walk
/// with `None`. When the path is exhausted on an object, its `"value"` key is
/// passed through [`extract_number`].
pub fn extract_nested(root: &Map<String, Value>, path: &[&str]) -> Option<f64> {
    let mut current = root;

    for key in path {
        match current.get(*key)? {
            Value::Object(next) => current = next,
            Value::Number(n) => return n.as_f64(),
            _ => return None,
        }
    }

    current.get(VALUE_KEY).and_then(extract_number)
}

/// Resolve a chain of keys that must all be objects.
pub fn object_at<'a>(
    root: &'a Map<String, Value>,
    path: &[&str],
) -> Option<&'a Map<String, Value>> {
    path.iter()
        .try_fold(root, |current, key| current.get(*key)?.as_object())
}

/// Name of a JSON value's type, for log messages.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
