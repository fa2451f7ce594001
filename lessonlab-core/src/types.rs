//! Core identifier types for the experiment core.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AssignmentError;

/// Longest participant id accepted before falling back to a generated one.
pub const MAX_PARTICIPANT_ID_LEN: usize = 128;

/// Identifier of one participant in the experiment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Validate a raw participant id.
    ///
    /// Surrounding whitespace is trimmed. Empty ids, ids longer than
    /// [`MAX_PARTICIPANT_ID_LEN`] characters and ids containing control
    /// characters are rejected.
    pub fn parse(raw: &str) -> Result<Self, AssignmentError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AssignmentError::Empty);
        }
        let len = trimmed.chars().count();
        if len > MAX_PARTICIPANT_ID_LEN {
            return Err(AssignmentError::TooLong {
                len,
                max: MAX_PARTICIPANT_ID_LEN,
            });
        }
        if let Some(c) = trimmed.chars().find(|c| c.is_control()) {
            return Err(AssignmentError::InvalidCharacter(c));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Generate a fresh development id (`dev-<uuid>`).
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("dev-{}", Uuid::new_v4().simple()))
    }

    /// Borrow the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this id was produced by [`ParticipantId::generate`].
    #[must_use]
    pub fn is_generated(&self) -> bool {
        self.0.starts_with("dev-")
    }

    /// File-system safe form of the id, used for local cache directories.
    ///
    /// Characters outside `[A-Za-z0-9_-]` are hex-escaped so distinct ids
    /// never collide.
    #[must_use]
    pub fn cache_key(&self) -> String {
        let mut key = String::with_capacity(self.0.len());
        for c in self.0.chars() {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                key.push(c);
            } else {
                key.push_str(&format!("~{:06x}", c as u32));
            }
        }
        key
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Index of an item in the question pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub u32);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a conversation turn, monotonic within one lesson session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnId(pub u64);

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to a simulated classroom agent in the session roster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentRef(pub String);

impl AgentRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
