//! Persistence envelopes and payload hashing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{Result, Tier};

/// Metadata written alongside every persisted payload.
///
/// The payload hash lets a retry on another tier be recognised as the same
/// write; `written_at` resolves conflicts between tiers on load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceEnvelope {
    pub target_tier: Tier,
    pub attempt: u32,
    pub payload_hash: String,
    pub written_at: DateTime<Utc>,
}

impl PersistenceEnvelope {
    pub fn new(
        target_tier: Tier,
        attempt: u32,
        payload_hash: impl Into<String>,
        written_at: DateTime<Utc>,
    ) -> Self {
        Self {
            target_tier,
            attempt,
            payload_hash: payload_hash.into(),
            written_at,
        }
    }
}

/// A payload as read back from a tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stored<T> {
    pub payload: T,
    pub envelope: PersistenceEnvelope,
}

/// Lowercase hex SHA-256 of the payload's JSON encoding.
pub fn payload_hash<T: Serialize>(payload: &T) -> Result<String> {
    let bytes = serde_json::to_vec(payload)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_hex_encoded() {
        let a = payload_hash(&vec!["x", "y"]).unwrap();
        let b = payload_hash(&vec!["x", "y"]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn hash_changes_with_payload() {
        assert_ne!(
            payload_hash(&"answer: 8").unwrap(),
            payload_hash(&"answer: 9").unwrap()
        );
    }

    #[test]
    fn envelope_serialization_roundtrip() {
        let envelope = PersistenceEnvelope::new(Tier::Secondary, 2, "abc", Utc::now());
        let json = serde_json::to_string(&envelope).unwrap();
        let parsed: PersistenceEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(envelope, parsed);
        assert!(json.contains("\"secondary\""));
    }
}
