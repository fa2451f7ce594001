//! Error types for session storage.

use thiserror::Error;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Database error from libSQL.
    #[error("database error: {0}")]
    Database(#[from] libsql::Error),

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Local cache file error.
    #[error("local cache error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid data in a tier.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// A tier refused or could not be reached.
    #[error("tier unavailable: {0}")]
    Unavailable(String),

    /// Every tier, including the local cache, failed.
    #[error("all storage tiers failed for participant {participant} ({key}): {}", failures.join("; "))]
    Exhausted {
        participant: String,
        key: String,
        failures: Vec<String>,
    },
}
