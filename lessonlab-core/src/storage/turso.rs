//! Turso/libSQL implementation of a remote session tier.
//!
//! The same type backs either remote tier. It can connect to:
//! - Remote Turso database (cloud)
//! - Local embedded SQLite file

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Builder, Connection, Database};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use super::{Error, PersistenceEnvelope, Result, SessionTier, Stored, Tier};
use crate::assignment::ParticipantContext;
use crate::record::{SessionRecord, SurveyResponse};
use crate::types::ParticipantId;

/// SQL schema for the participants table.
const SCHEMA_PARTICIPANTS: &str = r#"
CREATE TABLE IF NOT EXISTS participants (
    participant_id TEXT PRIMARY KEY,
    payload TEXT NOT NULL,
    payload_hash TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    tier TEXT NOT NULL,
    written_at TEXT NOT NULL
)
"#;

/// SQL schema for the session records table.
const SCHEMA_RECORDS: &str = r#"
CREATE TABLE IF NOT EXISTS session_records (
    participant_id TEXT NOT NULL,
    item_id INTEGER NOT NULL,
    payload TEXT NOT NULL,
    payload_hash TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    tier TEXT NOT NULL,
    written_at TEXT NOT NULL,
    PRIMARY KEY (participant_id, item_id)
)
"#;

/// SQL schema for the surveys table.
const SCHEMA_SURVEYS: &str = r#"
CREATE TABLE IF NOT EXISTS surveys (
    participant_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    payload_hash TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    tier TEXT NOT NULL,
    written_at TEXT NOT NULL,
    PRIMARY KEY (participant_id, kind)
)
"#;

/// Turso-backed session tier.
#[derive(Clone)]
pub struct TursoSessionStore {
    name: String,
    _db: Arc<Database>,
    conn: Connection,
}

impl TursoSessionStore {
    /// Create a store backed by a local embedded database.
    pub async fn new_local(name: impl Into<String>, path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let db = Builder::new_local(path).build().await?;
        Self::from_database(name.into(), db).await
    }

    /// Create a store connected to a remote Turso database.
    pub async fn new_remote(name: impl Into<String>, url: &str, token: &str) -> Result<Self> {
        let db = Builder::new_remote(url.to_string(), token.to_string())
            .build()
            .await?;
        Self::from_database(name.into(), db).await
    }

    /// Create an in-memory store (for testing).
    pub async fn new_memory(name: impl Into<String>) -> Result<Self> {
        let db = Builder::new_local(":memory:").build().await?;
        Self::from_database(name.into(), db).await
    }

    async fn from_database(name: String, db: Database) -> Result<Self> {
        // One connection for the store's lifetime so in-memory databases
        // keep their contents between calls.
        let conn = db.connect()?;
        let store = Self {
            name,
            _db: Arc::new(db),
            conn,
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Ensure the database schema exists.
    async fn ensure_schema(&self) -> Result<()> {
        self.conn.execute(SCHEMA_PARTICIPANTS, ()).await?;
        self.conn.execute(SCHEMA_RECORDS, ()).await?;
        self.conn.execute(SCHEMA_SURVEYS, ()).await?;
        Ok(())
    }

    /// Parse `(payload, payload_hash, attempt, tier, written_at)` from a row.
    fn parse_stored<T: DeserializeOwned>(row: &libsql::Row) -> Result<Stored<T>> {
        let payload_json: String = row.get(0)?;
        let payload_hash: String = row.get(1)?;
        let attempt: i64 = row.get(2)?;
        let tier_str: String = row.get(3)?;
        let written_at_str: String = row.get(4)?;

        let payload: T = serde_json::from_str(&payload_json)?;
        let target_tier = Tier::parse(&tier_str)
            .ok_or_else(|| Error::InvalidData(format!("invalid tier: {}", tier_str)))?;
        let attempt = u32::try_from(attempt)
            .map_err(|_| Error::InvalidData(format!("invalid attempt: {}", attempt)))?;

        Ok(Stored {
            payload,
            envelope: PersistenceEnvelope::new(
                target_tier,
                attempt,
                payload_hash,
                parse_datetime(&written_at_str)?,
            ),
        })
    }

    async fn query_stored<T: DeserializeOwned>(
        &self,
        sql: &str,
        participant: &ParticipantId,
    ) -> Result<Vec<Stored<T>>> {
        let mut rows = self.conn.query(sql, [participant.as_str()]).await?;
        let mut stored = Vec::new();
        while let Some(row) = rows.next().await? {
            stored.push(Self::parse_stored(&row)?);
        }
        Ok(stored)
    }
}

#[async_trait]
impl SessionTier for TursoSessionStore {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, record, envelope), fields(tier = %self.name), level = "debug")]
    async fn upsert_record(
        &self,
        participant: &ParticipantId,
        record: &SessionRecord,
        envelope: &PersistenceEnvelope,
    ) -> Result<()> {
        debug!(item = %record.item_id, hash = %envelope.payload_hash, "upserting session record");
        let payload = serde_json::to_string(record)?;
        self.conn
            .execute(
                "INSERT INTO session_records (participant_id, item_id, payload, payload_hash, attempt, tier, written_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(participant_id, item_id) DO UPDATE SET \
                 payload = excluded.payload, payload_hash = excluded.payload_hash, attempt = excluded.attempt, \
                 tier = excluded.tier, written_at = excluded.written_at",
                libsql::params![
                    participant.as_str(),
                    i64::from(record.item_id.0),
                    payload,
                    envelope.payload_hash.clone(),
                    i64::from(envelope.attempt),
                    envelope.target_tier.as_str(),
                    format_datetime(envelope.written_at)
                ],
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(tier = %self.name), level = "debug")]
    async fn load_records(&self, participant: &ParticipantId) -> Result<Vec<Stored<SessionRecord>>> {
        self.query_stored(
            "SELECT payload, payload_hash, attempt, tier, written_at FROM session_records WHERE participant_id = ? ORDER BY item_id ASC",
            participant,
        )
        .await
    }

    #[instrument(skip(self, context, envelope), fields(tier = %self.name), level = "debug")]
    async fn upsert_context(
        &self,
        context: &ParticipantContext,
        envelope: &PersistenceEnvelope,
    ) -> Result<()> {
        debug!(participant = %context.participant_id, stage = %context.current_stage, "upserting participant context");
        let payload = serde_json::to_string(context)?;
        self.conn
            .execute(
                "INSERT INTO participants (participant_id, payload, payload_hash, attempt, tier, written_at) \
                 VALUES (?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(participant_id) DO UPDATE SET \
                 payload = excluded.payload, payload_hash = excluded.payload_hash, attempt = excluded.attempt, \
                 tier = excluded.tier, written_at = excluded.written_at",
                libsql::params![
                    context.participant_id.as_str(),
                    payload,
                    envelope.payload_hash.clone(),
                    i64::from(envelope.attempt),
                    envelope.target_tier.as_str(),
                    format_datetime(envelope.written_at)
                ],
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(tier = %self.name), level = "debug")]
    async fn load_context(
        &self,
        participant: &ParticipantId,
    ) -> Result<Option<Stored<ParticipantContext>>> {
        let mut stored = self
            .query_stored(
                "SELECT payload, payload_hash, attempt, tier, written_at FROM participants WHERE participant_id = ?",
                participant,
            )
            .await?;
        Ok(stored.pop())
    }

    #[instrument(skip(self, survey, envelope), fields(tier = %self.name), level = "debug")]
    async fn upsert_survey(
        &self,
        participant: &ParticipantId,
        survey: &SurveyResponse,
        envelope: &PersistenceEnvelope,
    ) -> Result<()> {
        debug!(kind = survey.kind.as_str(), "upserting survey response");
        let payload = serde_json::to_string(survey)?;
        self.conn
            .execute(
                "INSERT INTO surveys (participant_id, kind, payload, payload_hash, attempt, tier, written_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(participant_id, kind) DO UPDATE SET \
                 payload = excluded.payload, payload_hash = excluded.payload_hash, attempt = excluded.attempt, \
                 tier = excluded.tier, written_at = excluded.written_at",
                libsql::params![
                    participant.as_str(),
                    survey.kind.as_str(),
                    payload,
                    envelope.payload_hash.clone(),
                    i64::from(envelope.attempt),
                    envelope.target_tier.as_str(),
                    format_datetime(envelope.written_at)
                ],
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(tier = %self.name), level = "debug")]
    async fn load_surveys(
        &self,
        participant: &ParticipantId,
    ) -> Result<Vec<Stored<SurveyResponse>>> {
        self.query_stored(
            "SELECT payload, payload_hash, attempt, tier, written_at FROM surveys WHERE participant_id = ? ORDER BY kind ASC",
            participant,
        )
        .await
    }
}

/// Format a datetime for storage.
fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Parse a datetime from storage.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| Error::InvalidData(format!("invalid datetime: {}", s)))
}
