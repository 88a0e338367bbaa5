//! Content hashing for raw payloads

use sha2::{Digest, Sha256};

/// SHA-256 hex digest of arbitrary bytes
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 hex digest of a JSON payload.
///
/// Object keys serialize in sorted order, so two payloads that differ only in
/// key order hash identically.
pub fn payload_hash(payload: &serde_json::Value) -> String {
    content_hash(canonical(payload).to_string().as_bytes())
}

fn canonical(value: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;

    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = serde_json::Map::with_capacity(map.len());
            for key in keys {
                if let Some(inner) = map.get(key) {
                    sorted.insert(key.clone(), canonical(inner));
                }
            }
            Value::Object(sorted)
        },
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}
