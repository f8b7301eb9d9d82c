//! Deterministic content checksums over canonical JSON.
//!
//! Checksums are compared across devices and processes, so they must be
//! derived from the entity content itself: SHA-256 over a canonical
//! serialization with recursively sorted object keys and no insignificant
//! whitespace.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Render a JSON value in canonical form: object keys sorted, arrays in
/// order, no whitespace. Two structurally equal values always produce the
/// same string regardless of original key order.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
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
        other => out.push_str(&other.to_string()),
    }
}

/// Compute the hex-encoded SHA-256 checksum of a JSON value's canonical form.
pub fn checksum_of(value: &Value) -> String {
    let canonical = canonical_json(value);
    let digest = Sha256::digest(canonical.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Compute the checksum of any serializable entity snapshot.
pub fn checksum_of_entity<T: Serialize>(entity: &T) -> Result<String> {
    let value = serde_json::to_value(entity).map_err(|e| Error::Serialization(e.to_string()))?;
    Ok(checksum_of(&value))
}

/// Compute the hex-encoded SHA-256 checksum of raw bytes.
pub fn checksum_of_bytes(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_sorts_keys() {
        let a = json!({"b": 1, "a": {"d": 2, "c": 3}});
        assert_eq!(canonical_json(&a), r#"{"a":{"c":3,"d":2},"b":1}"#);
    }

    #[test]
    fn test_checksum_independent_of_key_order() {
        let a: Value = serde_json::from_str(r#"{"x": 1, "y": [1, 2], "z": "s"}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"z": "s", "x": 1, "y": [1, 2]}"#).unwrap();
        assert_eq!(checksum_of(&a), checksum_of(&b));
    }

    #[test]
    fn test_checksum_sensitive_to_content() {
        let a = json!({"name": "Song A"});
        let b = json!({"name": "Song B"});
        assert_ne!(checksum_of(&a), checksum_of(&b));
    }

    #[test]
    fn test_array_order_matters() {
        let a = json!([1, 2]);
        let b = json!([2, 1]);
        assert_ne!(checksum_of(&a), checksum_of(&b));
    }

    #[test]
    fn test_checksum_is_hex_sha256() {
        let sum = checksum_of(&json!({}));
        assert_eq!(sum.len(), 64);
        assert!(sum.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
