//! Canonical JSON serialization and the stable input hash.
//!
//! Object keys are sorted lexicographically at every depth so the hash is
//! stable across machines and runtimes.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize a value canonically: compact, keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            // serde_json handles escaping; a string always serializes.
            out.push_str(&serde_json::to_string(s).unwrap_or_default());
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
    }
}

/// SHA-256 over the canonical JSON of `{model, input, params}`, hex-encoded.
/// Primary key of the request dedup.
pub fn input_hash(model: &str, input: &Value, params: &Value) -> String {
    let envelope = serde_json::json!({
        "model": model,
        "input": input,
        "params": params,
    });
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(&envelope).as_bytes());
    format!("{:x}", hasher.finalize())
}
