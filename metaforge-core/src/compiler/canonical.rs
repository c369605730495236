use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt::Write;

/// Encode bytes as lowercase hex.
pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut acc, b| {
        let _ = write!(acc, "{:02x}", b);
        acc
    })
}

/// Canonical JSON (RFC 8785): lexicographically sorted keys, no whitespace,
/// stable scalar formatting. The sole input to hashing; two logically equal
/// documents canonicalize to identical bytes regardless of source key order.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String> {
    serde_jcs::to_string(value).context("canonical JSON serialization failed")
}

/// SHA-256 of the canonical JSON of `value`, as lowercase hex.
pub fn hash_canonical<T: Serialize>(value: &T) -> Result<String> {
    let canonical = canonical_json(value)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex_encode(&hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_is_invariant_under_key_reordering() {
        let a = json!({"b": 1, "a": {"y": true, "x": "s"}});
        let b = json!({"a": {"x": "s", "y": true}, "b": 1});
        assert_eq!(hash_canonical(&a).unwrap(), hash_canonical(&b).unwrap());
    }

    #[test]
    fn different_values_hash_differently() {
        let a = json!({"a": 1});
        let b = json!({"a": 2});
        assert_ne!(hash_canonical(&a).unwrap(), hash_canonical(&b).unwrap());
    }

    #[test]
    fn canonical_form_has_sorted_keys_and_no_whitespace() {
        let doc = json!({"z": 1, "a": [1, 2]});
        assert_eq!(canonical_json(&doc).unwrap(), r#"{"a":[1,2],"z":1}"#);
    }
}
