//! Canonical JSON serialization and SHA-256 hashing.
//!
//! Every hash stored by Capsule — plan hashes, policy hashes, input and
//! output hashes — is computed over the canonical JSON form of a value, so
//! the serializer is load-bearing: two semantically equal values must
//! always produce identical bytes.
//!
//! Canonical form:
//!   - object keys sorted ascending by UTF-8 byte order
//!   - arrays preserved in order
//!   - no insignificant whitespace
//!   - strings escaped per standard JSON
//!   - numbers in serde_json's shortest round-trip ASCII form
//!   - `null` permitted
//!
//! The serializer is written out explicitly rather than relying on a
//! library default, and is pinned by tests below.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{CapsuleError, CapsuleResult};

/// Serialize `value` to its canonical JSON byte form.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

/// Canonicalize any serializable value.
///
/// The value is first converted to a `serde_json::Value` tree, then written
/// canonically. Returns a `PlanValidation` error if the value cannot be
/// represented as JSON (non-string map keys, NaN floats).
pub fn to_canonical_json<T: Serialize>(value: &T) -> CapsuleResult<String> {
    let tree = serde_json::to_value(value).map_err(|e| CapsuleError::PlanValidation {
        reason: format!("value is not representable as JSON: {}", e),
    })?;
    Ok(canonical_json(&tree))
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        // serde_json renders numbers via itoa/ryu: shortest round-trip ASCII.
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(out, key);
                out.push(':');
                write_value(out, &map[key.as_str()]);
            }
            out.push('}');
        }
    }
}

fn write_string(out: &mut String, s: &str) {
    // serde_json applies the standard JSON escapes; string leaves cannot
    // fail to serialize.
    out.push_str(&serde_json::to_string(s).expect("string serialization is infallible"));
}

/// SHA-256 over raw bytes, as lowercase hex.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// SHA-256 over the canonical JSON form of `value`, as lowercase hex.
pub fn hash_json(value: &Value) -> String {
    hash_bytes(canonical_json(value).as_bytes())
}

/// Hash an optional recorded output.
///
/// Absent output hashes to the empty string so "no output" is
/// distinguishable from an explicit JSON `null`.
pub fn hash_optional(value: Option<&Value>) -> String {
    match value {
        Some(v) => hash_json(v),
        None => String::new(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
