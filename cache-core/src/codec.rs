//! Value codec: one record holds a single-entry map `{namespacedKey: value}`.

use serde_json::Value;
use shared::{Error, Result};
use std::collections::BTreeMap;

pub fn encode_entry(namespaced_key: &str, value: &Value) -> Result<Vec<u8>> {
    let mut entry: BTreeMap<&str, &Value> = BTreeMap::new();
    entry.insert(namespaced_key, value);
    serde_json::to_vec(&entry)
        .map_err(|e| Error::Encoding(format!("failed to encode {}: {}", namespaced_key, e)))
}

pub fn decode_entry(namespaced_key: &str, payload: &[u8]) -> Result<Value> {
    let mut entry: BTreeMap<String, Value> = serde_json::from_slice(payload)
        .map_err(|e| Error::Encoding(format!("failed to decode {}: {}", namespaced_key, e)))?;

    entry.remove(namespaced_key).ok_or_else(|| {
        Error::Encoding(format!(
            "key {} not found in decoded value",
            namespaced_key
        ))
    })
}
