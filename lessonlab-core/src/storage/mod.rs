//! Tiered, idempotent persistence for participant data.
//!
//! Writes go through three tiers:
//! - [`LocalCache`] - JSON files written synchronously before any remote call
//! - primary [`SessionTier`] - the main remote store
//! - secondary [`SessionTier`] - attempted only when the primary fails
//!
//! [`TieredStore`] drives the write path and reconciles the tiers. The
//! libSQL implementation ([`TursoSessionStore`]) can back either remote tier.

mod envelope;
mod error;
mod local;
mod tiered;
mod turso;

use std::fmt;

pub use envelope::{PersistenceEnvelope, Stored, payload_hash};
pub use error::{Error, Result};
pub use local::{CacheEntry, CacheKey, LocalCache};
pub use tiered::{ReconcileReport, SaveResult, TieredStore};
pub use turso::TursoSessionStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::assignment::ParticipantContext;
use crate::record::{SessionRecord, SurveyResponse};
use crate::types::ParticipantId;

/// A persistence destination, in order of preference for durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tier {
    Primary,
    Secondary,
    LocalCache,
}

impl Tier {
    /// Convert to database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::LocalCache => "local-cache",
        }
    }

    /// Parse from database string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "primary" => Some(Self::Primary),
            "secondary" => Some(Self::Secondary),
            "local-cache" => Some(Self::LocalCache),
            _ => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remote store that accepts participant payloads.
///
/// Writes are upserts keyed by participant (and item or survey kind);
/// writing the same key twice replaces the earlier copy.
#[async_trait]
pub trait SessionTier: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Insert or replace the record for `(participant, record.item_id)`.
    async fn upsert_record(
        &self,
        participant: &ParticipantId,
        record: &SessionRecord,
        envelope: &PersistenceEnvelope,
    ) -> Result<()>;

    /// All records stored for a participant.
    async fn load_records(&self, participant: &ParticipantId) -> Result<Vec<Stored<SessionRecord>>>;

    /// Insert or replace the participant context.
    async fn upsert_context(
        &self,
        context: &ParticipantContext,
        envelope: &PersistenceEnvelope,
    ) -> Result<()>;

    /// The stored participant context, if any.
    async fn load_context(
        &self,
        participant: &ParticipantId,
    ) -> Result<Option<Stored<ParticipantContext>>>;

    /// Insert or replace a survey response for `(participant, survey.kind)`.
    async fn upsert_survey(
        &self,
        participant: &ParticipantId,
        survey: &SurveyResponse,
        envelope: &PersistenceEnvelope,
    ) -> Result<()>;

    /// All survey responses stored for a participant.
    async fn load_surveys(&self, participant: &ParticipantId)
    -> Result<Vec<Stored<SurveyResponse>>>;
}
