use serde::Serialize;
use serde_json::Value;

use crate::error::{ArtifactError, MintlabResult};

/// Serialises `value` into the canonical JSON form used for all content
/// hashing: UTF-8, keys sorted, no insignificant whitespace, integers
/// verbatim, floats in shortest-round-trip form, currency as decimal
/// strings (via `rust_decimal`'s serde form).
///
/// Two semantically identical values always produce identical bytes, so
/// structured keys are never hashed through ad-hoc stringification.
pub fn to_canonical_json<T: Serialize>(value: &T) -> MintlabResult<String> {
    // Route through `Value`: serde_json's map is a BTreeMap, which yields
    // the sorted-key ordering the canonical form requires.
    let value: Value =
        serde_json::to_value(value).map_err(|e| ArtifactError::Canonical(e.to_string()))?;
    serde_json::to_string(&value).map_err(|e| ArtifactError::Canonical(e.to_string()).into())
}

/// Blake3 hex digest of the canonical JSON form of `value`.
pub fn content_hash<T: Serialize>(value: &T) -> MintlabResult<String> {
    Ok(hash_bytes(to_canonical_json(value)?.as_bytes()))
}

/// Blake3 hex digest of raw bytes.
pub fn hash_bytes(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}
