//! Cache key construction.
//!
//! A cache key identifies an (action, parameters) pair. Parameters are
//! serialized canonically so semantically equal parameter sets always map to
//! the same key.

use serde_json::{Map, Value};

/// Tag prepended to every persisted key so unrelated data sharing a backend is
/// never touched.
pub const NAMESPACE: &str = "hc_";

/// Build the logical cache key for an action and its parameters.
pub fn cache_key(action: &str, params: &Map<String, Value>) -> String {
    let mut key = String::with_capacity(action.len() + 16);
    key.push_str(action);
    key.push('_');
    write_object(&mut key, params);
    key
}

/// Prefix a logical key (or key prefix) with [`NAMESPACE`].
pub fn namespaced(key: &str) -> String {
    format!("{NAMESPACE}{key}")
}

/// Serialize a JSON value with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(&mut out, value);
    out
}

fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => write_object(out, map),
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_object(out: &mut String, map: &Map<String, Value>) {
    let mut entries: Vec<(&String, &Value)> = map.iter().collect();
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));

    out.push('{');
    for (index, (key, value)) in entries.into_iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        out.push_str(&Value::String(key.clone()).to_string());
        out.push(':');
        write_canonical(out, value);
    }
    out.push('}');
}
