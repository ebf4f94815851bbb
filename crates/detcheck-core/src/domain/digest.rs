//! Canonical JSON normalization and digest computation.
//!
//! Fingerprints and content ids are SHA-256 hex digests. Structured values are
//! canonicalized first:
//! - object keys sorted by UTF-16 code units (RFC 8785 §3.2.3)
//! - integer-valued floats collapsed to integers; NaN/Infinity rejected
//! - compact serialization

use crate::domain::error::{DetError, Result};
use sha2::{Digest, Sha256};

/// Recursively sort JSON object keys using UTF-16 code unit ordering.
fn sort_keys_utf16(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort_by(|a, b| a.encode_utf16().cmp(b.encode_utf16()));

            let mut sorted = serde_json::Map::new();
            for key in keys {
                if let Some(v) = map.get(key) {
                    sorted.insert(key.to_string(), sort_keys_utf16(v));
                }
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(sort_keys_utf16).collect())
        }
        other => other.clone(),
    }
}

/// Normalize numbers: integer-valued floats → integer repr; reject NaN/Infinity.
fn normalize_value(value: &serde_json::Value) -> Result<serde_json::Value> {
    match value {
        serde_json::Value::Object(map) => {
            let mut normalized = serde_json::Map::new();
            for (k, v) in map.iter() {
                normalized.insert(k.clone(), normalize_value(v)?);
            }
            Ok(serde_json::Value::Object(normalized))
        }
        serde_json::Value::Array(arr) => {
            let normalized = arr
                .iter()
                .map(normalize_value)
                .collect::<Result<Vec<_>>>()?;
            Ok(serde_json::Value::Array(normalized))
        }
        serde_json::Value::Number(n) if !(n.is_i64() || n.is_u64()) => match n.as_f64() {
            Some(f) if !f.is_finite() => Err(DetError::Canonicalization(
                "NaN/Infinity not permitted in canonical JSON".to_string(),
            )),
            Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => {
                Ok(serde_json::Value::Number(serde_json::Number::from(f as i64)))
            }
            _ => Ok(serde_json::Value::Number(n.clone())),
        },
        other => Ok(other.clone()),
    }
}

/// Convert a JSON value to canonical form: normalize numbers → sort keys → compact JSON.
pub fn canonical_json(value: &serde_json::Value) -> Result<String> {
    let normalized = normalize_value(value)?;
    let sorted = sort_keys_utf16(&normalized);
    Ok(serde_json::to_string(&sorted)?)
}

/// SHA-256 hex digest of the canonical JSON form of `value`.
pub fn compute_digest(value: &serde_json::Value) -> Result<String> {
    let canonical = canonical_json(value)?;
    Ok(sha256_hex(canonical.as_bytes()))
}

/// SHA-256 hex digest of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Stable id for a prompt: SHA-256 of its UTF-8 text.
pub fn prompt_id(prompt: &str) -> String {
    sha256_hex(prompt.as_bytes())
}

/// Stable hash of a token id sequence: SHA-256 of its compact JSON array form.
pub fn token_ids_hash(token_ids: &[u32]) -> String {
    let mut encoded = String::with_capacity(token_ids.len() * 4 + 2);
    encoded.push('[');
    for (i, id) in token_ids.iter().enumerate() {
        if i > 0 {
            encoded.push(',');
        }
        encoded.push_str(&id.to_string());
    }
    encoded.push(']');
    sha256_hex(encoded.as_bytes())
}
