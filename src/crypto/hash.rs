//! Content hashing for the sync-necessity check.
//!
//! The digest is an equality oracle between local and server state — never a
//! cryptographic commitment of authenticity; AEAD integrity lives in
//! [`store`](super::store).

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde_json::Value;

/// Algorithm tag prefixed to every digest, `"<algo>:<base64-digest>"`.
pub const HASH_ALGO_TAG: &str = "b3";

/// Digest of the canonical serialization of a JSON dataset.
///
/// `serde_json` maps are BTreeMap-backed here (the `preserve_order` feature
/// is off), so serializing a `Value` is already key-sorted: two semantically
/// equal documents hash identically regardless of how their keys were
/// ordered on arrival.
pub fn content_hash(value: &Value) -> String {
    let canonical = value.to_string();
    let digest = blake3::hash(canonical.as_bytes());
    format!("{HASH_ALGO_TAG}:{}", BASE64.encode(digest.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_order_does_not_change_the_hash() {
        let a: Value = serde_json::from_str(r#"{"b": 2, "a": 1, "nested": {"y": 0, "x": 9}}"#)
            .unwrap();
        let b: Value = serde_json::from_str(r#"{"nested": {"x": 9, "y": 0}, "a": 1, "b": 2}"#)
            .unwrap();
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn content_changes_change_the_hash() {
        let a: Value = serde_json::from_str(r#"{"a": 1}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": 2}"#).unwrap();
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn format_is_tag_colon_base64_of_256_bits() {
        let hash = content_hash(&serde_json::json!({"a": 1}));
        let (tag, digest) = hash.split_once(':').unwrap();
        assert_eq!(tag, HASH_ALGO_TAG);
        assert_eq!(digest.len(), 44);
        assert_eq!(BASE64.decode(digest).unwrap().len(), 32);
    }
}
