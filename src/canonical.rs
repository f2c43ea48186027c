//! Key-sorted JSON rendering used to decide whether two definitions are the same.
//!
//! Object keys are sorted at every depth, arrays keep their order and scalars
//! use the plain `serde_json` encoding. Numbers are not normalised beyond what
//! `serde_json` already does, so this is an equality oracle and not a full
//! RFC 8785 implementation.

use serde_json::Value;

/// Render `value` with object keys sorted recursively
pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// True when both values render to the same canonical string
pub fn canonically_equal(a: &Value, b: &Value) -> bool {
    canonicalize(a) == canonicalize(b)
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&Value::from(key.as_str()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
