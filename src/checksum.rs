//! Schema fingerprints
//!
//! A SHA256 over the canonical JSON of a schema. Graph builders key their
//! schema-derived caches on it, so one fingerprint means one schema version.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// SHA256 checksum for schema content
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum(String);

impl Checksum {
    /// Compute checksum from raw bytes
    pub fn from_bytes(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Self(format!("{:x}", hash))
    }

    /// Compute checksum from a serializable value.
    ///
    /// `serde_json::Value` maps are ordered, so round-tripping through it
    /// gives a stable byte form regardless of the source map's order.
    pub fn of<T: Serialize>(value: &T) -> Self {
        let canonical = serde_json::to_value(value)
            .and_then(|v| serde_json::to_vec(&v))
            .unwrap_or_default();
        Self::from_bytes(&canonical)
    }

    /// Get the hex string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form used in log lines
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable 64-bit hash of a raw JSON value.
///
/// Used for provided-instance ids and invocation cache keys, where the
/// identity of a value must ignore its provenance.
pub fn value_hash(value: &serde_json::Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    serde_json::to_string(value)
        .unwrap_or_default()
        .hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_checksum_consistency() {
        let checksum1 = Checksum::of(&json!({"name": "test", "version": "1.0.0"}));
        let checksum2 = Checksum::of(&json!({"version": "1.0.0", "name": "test"}));
        assert_eq!(checksum1, checksum2);
    }

    #[test]
    fn test_checksum_different_content() {
        let checksum1 = Checksum::of(&json!({"name": "test1"}));
        let checksum2 = Checksum::of(&json!({"name": "test2"}));
        assert_ne!(checksum1, checksum2);
        assert_eq!(checksum1.short().len(), 12);
    }

    #[test]
    fn test_value_hash_ignores_key_order() {
        assert_eq!(
            value_hash(&json!({"a": 1, "b": "x"})),
            value_hash(&json!({"b": "x", "a": 1}))
        );
        assert_ne!(value_hash(&json!("C1")), value_hash(&json!("C2")));
    }
}
