//! Content hashing
//!
//! Canonical-JSON SHA-256 used for record content hashes, compliance payload
//! hashes and the audit hash chain.

use crate::domain::{CarelinkError, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Calculate the SHA-256 checksum of JSON data
///
/// Object keys are sorted recursively before serialization, so semantically
/// identical documents hash the same regardless of key order.
///
/// # Examples
///
/// ```
/// use carelink::core::checksum::calculate_checksum;
/// use serde_json::json;
///
/// let a = calculate_checksum(&json!({"b": 1, "a": 2})).unwrap();
/// let b = calculate_checksum(&json!({"a": 2, "b": 1})).unwrap();
/// assert_eq!(a, b);
/// assert_eq!(a.len(), 64);
/// ```
pub fn calculate_checksum(data: &Value) -> Result<String> {
    let normalized = normalize_json(data);
    let data_str = serde_json::to_string(&normalized)
        .map_err(|e| CarelinkError::Serialization(e.to_string()))?;
    Ok(calculate_checksum_bytes(data_str.as_bytes()))
}

/// Checksum of a value chained onto a previous hash: `SHA-256(prev || canonical JSON)`
pub fn chained_checksum(prev_hash: &str, data: &Value) -> Result<String> {
    let normalized = normalize_json(data);
    let data_str = serde_json::to_string(&normalized)
        .map_err(|e| CarelinkError::Serialization(e.to_string()))?;

    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(data_str.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Recursively sort object keys
fn normalize_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), normalize_json(v)))
                .collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(arr) => Value::Array(arr.iter().map(normalize_json).collect()),
        _ => value.clone(),
    }
}

/// Calculate the SHA-256 checksum of raw bytes
pub fn calculate_checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_checksum_deterministic() {
        let data = json!({"demographics.family_name": "Smith", "clinical.allergies": []});
        assert_eq!(
            calculate_checksum(&data).unwrap(),
            calculate_checksum(&data).unwrap()
        );
    }

    #[test]
    fn test_checksum_nested_key_order() {
        let a = json!({"outer": {"x": 1, "y": [{"b": 2, "a": 1}]}});
        let b = json!({"outer": {"y": [{"a": 1, "b": 2}], "x": 1}});
        assert_eq!(calculate_checksum(&a).unwrap(), calculate_checksum(&b).unwrap());
    }

    #[test]
    fn test_checksum_different_content() {
        let a = json!({"birth_date": "1941-03-02"});
        let b = json!({"birth_date": "1941-03-03"});
        assert_ne!(calculate_checksum(&a).unwrap(), calculate_checksum(&b).unwrap());
    }

    #[test]
    fn test_chained_checksum_depends_on_prev() {
        let data = json!({"action": "record_fetch"});
        assert_ne!(
            chained_checksum("aa", &data).unwrap(),
            chained_checksum("bb", &data).unwrap()
        );
    }

    #[test]
    fn test_checksum_bytes_known_value() {
        assert_eq!(
            calculate_checksum_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
