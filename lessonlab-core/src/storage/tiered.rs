//! Write-ahead, tier-falling-back session store.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, warn};

use super::{
    CacheEntry, CacheKey, Error, LocalCache, PersistenceEnvelope, Result, SessionTier, Stored,
    Tier, TursoSessionStore, payload_hash,
};
use crate::assignment::ParticipantContext;
use crate::config::StorageConfig;
use crate::record::{SessionRecord, SurveyResponse};
use crate::types::{ItemId, ParticipantId};

/// Outcome of a successful save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveResult {
    /// Most durable tier that accepted the write.
    pub tier: Tier,
    pub payload_hash: String,
    /// Remote write attempts made, across all remote tiers.
    pub attempts: u32,
}

/// What a reconcile pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub context_flushed: bool,
    /// Unconfirmed local entries sent to a remote tier again.
    pub retried: usize,
    /// Entries a remote tier acknowledged during this pass.
    pub confirmed: usize,
}

/// A payload the store knows how to key and send to a remote tier.
trait Persist: Serialize + DeserializeOwned + Send + Sync {
    fn cache_key(&self) -> CacheKey;

    fn item(&self) -> Option<ItemId> {
        None
    }
}

impl Persist for ParticipantContext {
    fn cache_key(&self) -> CacheKey {
        CacheKey::Context
    }
}

impl Persist for SessionRecord {
    fn cache_key(&self) -> CacheKey {
        CacheKey::Record(self.item_id)
    }

    fn item(&self) -> Option<ItemId> {
        Some(self.item_id)
    }
}

impl Persist for SurveyResponse {
    fn cache_key(&self) -> CacheKey {
        CacheKey::Survey(self.kind)
    }
}

/// Borrowed payload dispatched to the matching [`SessionTier`] method.
enum Outbound<'a> {
    Context(&'a ParticipantContext),
    Record(&'a SessionRecord),
    Survey(&'a SurveyResponse),
}

trait AsOutbound {
    fn outbound(&self) -> Outbound<'_>;
}

impl AsOutbound for ParticipantContext {
    fn outbound(&self) -> Outbound<'_> {
        Outbound::Context(self)
    }
}

impl AsOutbound for SessionRecord {
    fn outbound(&self) -> Outbound<'_> {
        Outbound::Record(self)
    }
}

impl AsOutbound for SurveyResponse {
    fn outbound(&self) -> Outbound<'_> {
        Outbound::Survey(self)
    }
}

/// Result of walking the remote tiers for one payload.
struct RemoteOutcome {
    accepted: Option<Tier>,
    attempts: u32,
    failures: Vec<String>,
}

/// Session store with a local write-ahead cache and two remote tiers.
pub struct TieredStore {
    local: LocalCache,
    primary: Option<Arc<dyn SessionTier>>,
    secondary: Option<Arc<dyn SessionTier>>,
    remote_attempts: u32,
}

impl TieredStore {
    /// A store with only the local cache; add remotes with the builder methods.
    pub fn new(local: LocalCache) -> Self {
        Self {
            local,
            primary: None,
            secondary: None,
            remote_attempts: 2,
        }
    }

    pub fn with_primary(mut self, tier: Arc<dyn SessionTier>) -> Self {
        self.primary = Some(tier);
        self
    }

    pub fn with_secondary(mut self, tier: Arc<dyn SessionTier>) -> Self {
        self.secondary = Some(tier);
        self
    }

    pub fn with_remote_attempts(mut self, attempts: u32) -> Self {
        self.remote_attempts = attempts.max(1);
        self
    }

    /// Build a store from configuration.
    ///
    /// A remote tier that cannot be opened is skipped with a warning; the
    /// local cache keeps every write until a later reconcile reaches it.
    pub async fn open(config: &StorageConfig, primary_token: Option<&str>) -> Self {
        let mut store = Self::new(LocalCache::new(config.cache_dir.clone()))
            .with_remote_attempts(config.remote_attempts);

        let primary = match &config.primary_url {
            Some(url) => {
                TursoSessionStore::new_remote("primary", url, primary_token.unwrap_or_default())
                    .await
            }
            None => TursoSessionStore::new_local("primary", &config.primary_path).await,
        };
        match primary {
            Ok(tier) => store = store.with_primary(Arc::new(tier)),
            Err(e) => warn!(error = %e, "primary store unavailable, continuing without it"),
        }

        if let Some(path) = &config.secondary_path {
            match TursoSessionStore::new_local("secondary", path).await {
                Ok(tier) => store = store.with_secondary(Arc::new(tier)),
                Err(e) => warn!(error = %e, "secondary store unavailable, continuing without it"),
            }
        }

        store
    }

    #[must_use]
    pub fn local(&self) -> &LocalCache {
        &self.local
    }

    /// Upsert a session record for `(participant, record.item_id)`.
    ///
    /// An existing copy (local first, then primary) is merged with the new
    /// record before anything is written.
    #[instrument(skip(self, record), fields(participant = %participant, item = %record.item_id), level = "debug")]
    pub async fn save(&self, participant: &ParticipantId, record: SessionRecord) -> Result<SaveResult> {
        let merged = match self.existing_record(participant, record.item_id).await {
            Some(mut existing) => {
                existing.merge_from(record);
                existing
            }
            None => record,
        };
        self.persist(participant, &merged).await
    }

    /// Write-ahead then remote save of the participant context.
    #[instrument(skip(self, context), fields(participant = %context.participant_id, stage = %context.current_stage), level = "debug")]
    pub async fn save_context(&self, context: &ParticipantContext) -> Result<SaveResult> {
        self.persist(&context.participant_id, context).await
    }

    /// Write-ahead then remote save of a survey response.
    #[instrument(skip(self, survey), fields(participant = %participant, kind = survey.kind.as_str()), level = "debug")]
    pub async fn save_survey(
        &self,
        participant: &ParticipantId,
        survey: &SurveyResponse,
    ) -> Result<SaveResult> {
        self.persist(participant, survey).await
    }

    /// Every record for `participant`, newest copy per item across tiers.
    ///
    /// Fails only when no tier could be read at all.
    #[instrument(skip(self), level = "debug")]
    pub async fn load(&self, participant: &ParticipantId) -> Result<Vec<SessionRecord>> {
        let mut failures = Vec::new();
        let mut sources = 0usize;
        let mut newest: BTreeMap<ItemId, (DateTime<Utc>, SessionRecord)> = BTreeMap::new();

        for (tier_kind, tier) in self.remotes() {
            sources += 1;
            match tier.load_records(participant).await {
                Ok(stored) => {
                    for s in stored {
                        keep_newest(&mut newest, s.payload.item_id, s.envelope.written_at, s.payload);
                    }
                }
                Err(e) => {
                    warn!(tier = %tier_kind, error = %e, "failed to load records");
                    failures.push(format!("{}: {}", tier_kind, e));
                }
            }
        }

        sources += 1;
        match self.local.read_records(participant) {
            Ok(entries) => {
                for entry in entries {
                    keep_newest(
                        &mut newest,
                        entry.payload.item_id,
                        entry.envelope.written_at,
                        entry.payload,
                    );
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to read local records");
                failures.push(format!("{}: {}", Tier::LocalCache, e));
            }
        }

        if failures.len() == sources {
            return Err(Error::Exhausted {
                participant: participant.to_string(),
                key: "records".to_string(),
                failures,
            });
        }
        Ok(newest.into_values().map(|(_, record)| record).collect())
    }

    /// The newest stored context for `participant` across tiers.
    #[instrument(skip(self), level = "debug")]
    pub async fn load_context(
        &self,
        participant: &ParticipantId,
    ) -> Result<Option<ParticipantContext>> {
        let mut failures = Vec::new();
        let mut sources = 0usize;
        let mut best: Option<(DateTime<Utc>, ParticipantContext)> = None;

        for (tier_kind, tier) in self.remotes() {
            sources += 1;
            match tier.load_context(participant).await {
                Ok(Some(Stored { payload, envelope })) => {
                    if best.as_ref().is_none_or(|(at, _)| envelope.written_at > *at) {
                        best = Some((envelope.written_at, payload));
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(tier = %tier_kind, error = %e, "failed to load context");
                    failures.push(format!("{}: {}", tier_kind, e));
                }
            }
        }

        sources += 1;
        match self.local.read::<ParticipantContext>(participant, CacheKey::Context) {
            Ok(Some(entry)) => {
                if best
                    .as_ref()
                    .is_none_or(|(at, _)| entry.envelope.written_at > *at)
                {
                    best = Some((entry.envelope.written_at, entry.payload));
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "failed to read local context");
                failures.push(format!("{}: {}", Tier::LocalCache, e));
            }
        }

        if failures.len() == sources {
            return Err(Error::Exhausted {
                participant: participant.to_string(),
                key: CacheKey::Context.to_string(),
                failures,
            });
        }
        Ok(best.map(|(_, context)| context))
    }

    /// Survey responses for `participant`, newest copy per kind across tiers.
    #[instrument(skip(self), level = "debug")]
    pub async fn load_surveys(&self, participant: &ParticipantId) -> Result<Vec<SurveyResponse>> {
        let mut failures = Vec::new();
        let mut sources = 0usize;
        let mut newest: BTreeMap<&'static str, (DateTime<Utc>, SurveyResponse)> = BTreeMap::new();

        for (tier_kind, tier) in self.remotes() {
            sources += 1;
            match tier.load_surveys(participant).await {
                Ok(stored) => {
                    for s in stored {
                        keep_newest(&mut newest, s.payload.kind.as_str(), s.envelope.written_at, s.payload);
                    }
                }
                Err(e) => {
                    warn!(tier = %tier_kind, error = %e, "failed to load surveys");
                    failures.push(format!("{}: {}", tier_kind, e));
                }
            }
        }

        sources += 1;
        match self.local.read_surveys(participant) {
            Ok(entries) => {
                for entry in entries {
                    keep_newest(
                        &mut newest,
                        entry.payload.kind.as_str(),
                        entry.envelope.written_at,
                        entry.payload,
                    );
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to read local surveys");
                failures.push(format!("{}: {}", Tier::LocalCache, e));
            }
        }

        if failures.len() == sources {
            return Err(Error::Exhausted {
                participant: participant.to_string(),
                key: "surveys".to_string(),
                failures,
            });
        }
        Ok(newest.into_values().map(|(_, survey)| survey).collect())
    }

    /// Flush `context` to the local cache and retry unconfirmed entries.
    ///
    /// Called on every stage transition. Only a failed local flush is an
    /// error; remote failures leave entries unconfirmed for the next pass.
    #[instrument(skip(self, context), fields(participant = %context.participant_id, stage = %context.current_stage), level = "debug")]
    pub async fn reconcile_all(&self, context: &ParticipantContext) -> Result<ReconcileReport> {
        let participant = &context.participant_id;
        let mut report = ReconcileReport::default();

        self.flush_local(participant, context)?;
        report.context_flushed = true;

        if self.primary.is_some() || self.secondary.is_some() {
            if let Some(entry) = self.local.read::<ParticipantContext>(participant, CacheKey::Context)? {
                self.retry_unconfirmed(participant, entry, &mut report).await;
            }
            for entry in self.local.read_records(participant)? {
                self.retry_unconfirmed(participant, entry, &mut report).await;
            }
            for entry in self.local.read_surveys(participant)? {
                self.retry_unconfirmed(participant, entry, &mut report).await;
            }
        }

        info!(
            participant = %participant,
            retried = report.retried,
            confirmed = report.confirmed,
            "reconciled storage tiers"
        );
        Ok(report)
    }

    /// Rewrite the local context entry, keeping its confirmation when the
    /// payload is unchanged.
    fn flush_local(&self, participant: &ParticipantId, context: &ParticipantContext) -> Result<()> {
        let hash = payload_hash(context)?;
        let confirmed_by = self
            .local
            .read::<ParticipantContext>(participant, CacheKey::Context)?
            .filter(|entry| entry.envelope.payload_hash == hash)
            .and_then(|entry| entry.confirmed_by);

        let entry = CacheEntry {
            payload: context.clone(),
            envelope: PersistenceEnvelope::new(Tier::LocalCache, 1, hash, Utc::now()),
            confirmed_by,
        };
        self.local.write(participant, CacheKey::Context, &entry)
    }

    async fn retry_unconfirmed<T: Persist + AsOutbound>(
        &self,
        participant: &ParticipantId,
        mut entry: CacheEntry<T>,
        report: &mut ReconcileReport,
    ) {
        if entry.is_confirmed() {
            return;
        }
        let key = entry.payload.cache_key();
        report.retried += 1;

        let outcome = self
            .write_remote(
                participant,
                &entry.payload,
                &entry.envelope.payload_hash,
                entry.envelope.written_at,
            )
            .await;

        if let Some(tier) = outcome.accepted {
            entry.confirmed_by = Some(tier);
            match self.local.write(participant, key, &entry) {
                Ok(()) => report.confirmed += 1,
                Err(e) => warn!(%key, error = %e, "confirmed remotely but could not mark local entry"),
            }
        } else {
            debug!(%key, failures = outcome.failures.len(), "entry still unconfirmed");
        }
    }

    async fn existing_record(&self, participant: &ParticipantId, item: ItemId) -> Option<SessionRecord> {
        match self
            .local
            .read::<SessionRecord>(participant, CacheKey::Record(item))
        {
            Ok(Some(entry)) => return Some(entry.payload),
            Ok(None) => {}
            Err(e) => debug!(error = %e, "local lookup failed before merge"),
        }

        let primary = self.primary.as_ref()?;
        match primary.load_records(participant).await {
            Ok(stored) => stored
                .into_iter()
                .map(|s| s.payload)
                .find(|record| record.item_id == item),
            Err(e) => {
                debug!(error = %e, "primary lookup failed before merge");
                None
            }
        }
    }

    async fn persist<T: Persist + AsOutbound>(
        &self,
        participant: &ParticipantId,
        payload: &T,
    ) -> Result<SaveResult> {
        let key = payload.cache_key();
        let hash = payload_hash(payload)?;
        let written_at = Utc::now();
        let mut failures = Vec::new();

        let local_entry = CacheEntry {
            payload,
            envelope: PersistenceEnvelope::new(Tier::LocalCache, 1, hash.clone(), written_at),
            confirmed_by: None,
        };
        let local_ok = match self.local.write(participant, key, &local_entry) {
            Ok(()) => true,
            Err(e) => {
                warn!(participant = %participant, %key, error = %e, "local cache write failed");
                failures.push(format!("{}: {}", Tier::LocalCache, e));
                false
            }
        };

        let outcome = self.write_remote(participant, payload, &hash, written_at).await;
        failures.extend(outcome.failures);

        if let Some(tier) = outcome.accepted {
            if local_ok {
                let confirmed = CacheEntry {
                    confirmed_by: Some(tier),
                    ..local_entry
                };
                if let Err(e) = self.local.write(participant, key, &confirmed) {
                    warn!(participant = %participant, %key, error = %e, "could not mark local entry confirmed");
                }
            }
            debug!(participant = %participant, %key, %tier, item = ?payload.item(), "save confirmed");
            return Ok(SaveResult {
                tier,
                payload_hash: hash,
                attempts: outcome.attempts,
            });
        }

        if local_ok {
            warn!(participant = %participant, %key, "no remote tier accepted write, kept in local cache");
            return Ok(SaveResult {
                tier: Tier::LocalCache,
                payload_hash: hash,
                attempts: outcome.attempts,
            });
        }

        Err(Error::Exhausted {
            participant: participant.to_string(),
            key: key.to_string(),
            failures,
        })
    }

    /// Try primary then secondary, `remote_attempts` times each.
    async fn write_remote<T: AsOutbound>(
        &self,
        participant: &ParticipantId,
        payload: &T,
        hash: &str,
        written_at: DateTime<Utc>,
    ) -> RemoteOutcome {
        let mut outcome = RemoteOutcome {
            accepted: None,
            attempts: 0,
            failures: Vec::new(),
        };

        for (tier_kind, tier) in self.remotes() {
            for attempt in 1..=self.remote_attempts {
                outcome.attempts += 1;
                let envelope = PersistenceEnvelope::new(tier_kind, attempt, hash, written_at);
                let result = match payload.outbound() {
                    Outbound::Context(context) => tier.upsert_context(context, &envelope).await,
                    Outbound::Record(record) => {
                        tier.upsert_record(participant, record, &envelope).await
                    }
                    Outbound::Survey(survey) => {
                        tier.upsert_survey(participant, survey, &envelope).await
                    }
                };
                match result {
                    Ok(()) => {
                        outcome.accepted = Some(tier_kind);
                        return outcome;
                    }
                    Err(e) => {
                        warn!(
                            participant = %participant,
                            tier = tier.name(),
                            attempt,
                            error = %e,
                            "remote write failed"
                        );
                        outcome.failures.push(format!("{} attempt {}: {}", tier_kind, attempt, e));
                    }
                }
            }
        }

        outcome
    }

    fn remotes(&self) -> impl Iterator<Item = (Tier, &Arc<dyn SessionTier>)> {
        [
            (Tier::Primary, self.primary.as_ref()),
            (Tier::Secondary, self.secondary.as_ref()),
        ]
        .into_iter()
        .filter_map(|(kind, tier)| tier.map(|t| (kind, t)))
    }
}

/// Keep the copy with the latest `written_at`; earlier sources win ties.
fn keep_newest<K: Ord, V>(map: &mut BTreeMap<K, (DateTime<Utc>, V)>, key: K, at: DateTime<Utc>, value: V) {
    match map.get(&key) {
        Some((existing, _)) if *existing >= at => {}
        _ => {
            map.insert(key, (at, value));
        }
    }
}

impl std::fmt::Debug for TieredStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredStore")
            .field("local", &self.local)
            .field("primary", &self.primary.as_ref().map(|t| t.name().to_string()))
            .field("secondary", &self.secondary.as_ref().map(|t| t.name().to_string()))
            .field("remote_attempts", &self.remote_attempts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::assignment::assign;
    use crate::condition::Condition;
    use crate::record::{ConversationTurn, RecordPhase, RenderState, SpeakerKind, SurveyKind};
    use crate::stage::{Stage, transition};
    use crate::types::TurnId;

    /// Tier that refuses every call.
    struct FailingTier;

    #[async_trait]
    impl SessionTier for FailingTier {
        fn name(&self) -> &str {
            "failing"
        }

        async fn upsert_record(
            &self,
            _participant: &ParticipantId,
            _record: &SessionRecord,
            _envelope: &PersistenceEnvelope,
        ) -> Result<()> {
            Err(Error::Unavailable("connection refused".to_string()))
        }

        async fn load_records(&self, _participant: &ParticipantId) -> Result<Vec<Stored<SessionRecord>>> {
            Err(Error::Unavailable("connection refused".to_string()))
        }

        async fn upsert_context(
            &self,
            _context: &ParticipantContext,
            _envelope: &PersistenceEnvelope,
        ) -> Result<()> {
            Err(Error::Unavailable("connection refused".to_string()))
        }

        async fn load_context(
            &self,
            _participant: &ParticipantId,
        ) -> Result<Option<Stored<ParticipantContext>>> {
            Err(Error::Unavailable("connection refused".to_string()))
        }

        async fn upsert_survey(
            &self,
            _participant: &ParticipantId,
            _survey: &SurveyResponse,
            _envelope: &PersistenceEnvelope,
        ) -> Result<()> {
            Err(Error::Unavailable("connection refused".to_string()))
        }

        async fn load_surveys(
            &self,
            _participant: &ParticipantId,
        ) -> Result<Vec<Stored<SurveyResponse>>> {
            Err(Error::Unavailable("connection refused".to_string()))
        }
    }

    /// Tier that fails the first `failures` record writes, then delegates.
    struct FlakyTier {
        inner: TursoSessionStore,
        remaining_failures: Mutex<u32>,
    }

    impl FlakyTier {
        async fn new(failures: u32) -> Self {
            Self {
                inner: TursoSessionStore::new_memory("flaky").await.unwrap(),
                remaining_failures: Mutex::new(failures),
            }
        }

        fn should_fail(&self) -> bool {
            let mut remaining = self.remaining_failures.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                true
            } else {
                false
            }
        }
    }

    #[async_trait]
    impl SessionTier for FlakyTier {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn upsert_record(
            &self,
            participant: &ParticipantId,
            record: &SessionRecord,
            envelope: &PersistenceEnvelope,
        ) -> Result<()> {
            if self.should_fail() {
                return Err(Error::Unavailable("timeout".to_string()));
            }
            self.inner.upsert_record(participant, record, envelope).await
        }

        async fn load_records(&self, participant: &ParticipantId) -> Result<Vec<Stored<SessionRecord>>> {
            self.inner.load_records(participant).await
        }

        async fn upsert_context(
            &self,
            context: &ParticipantContext,
            envelope: &PersistenceEnvelope,
        ) -> Result<()> {
            self.inner.upsert_context(context, envelope).await
        }

        async fn load_context(
            &self,
            participant: &ParticipantId,
        ) -> Result<Option<Stored<ParticipantContext>>> {
            self.inner.load_context(participant).await
        }

        async fn upsert_survey(
            &self,
            participant: &ParticipantId,
            survey: &SurveyResponse,
            envelope: &PersistenceEnvelope,
        ) -> Result<()> {
            self.inner.upsert_survey(participant, survey, envelope).await
        }

        async fn load_surveys(
            &self,
            participant: &ParticipantId,
        ) -> Result<Vec<Stored<SurveyResponse>>> {
            self.inner.load_surveys(participant).await
        }
    }

    fn participant() -> ParticipantId {
        ParticipantId::parse("p-42").unwrap()
    }

    fn record(answer: &str) -> SessionRecord {
        let mut rec = SessionRecord::new(
            ItemId(5),
            "What is 3/4 of 12?",
            RecordPhase::Lesson,
            Condition::Multi,
            Utc::now(),
        );
        rec.final_answer = Some(answer.to_string());
        rec
    }

    fn turn(id: u64, body: &str) -> ConversationTurn {
        ConversationTurn {
            id: TurnId(id),
            speaker: SpeakerKind::Human,
            agent: None,
            body: body.to_string(),
            created_at: Utc::now(),
            render_state: RenderState::Settled,
            revealed: body.chars().count(),
            settled_at: Some(Utc::now()),
            fallback: false,
        }
    }

    async fn memory_tier(name: &str) -> Arc<TursoSessionStore> {
        Arc::new(TursoSessionStore::new_memory(name).await.unwrap())
    }

    #[tokio::test]
    async fn saving_twice_keeps_one_record_with_latest_answer() {
        let dir = tempfile::tempdir().unwrap();
        let primary = memory_tier("primary").await;
        let store = TieredStore::new(LocalCache::new(dir.path())).with_primary(primary.clone());

        store.save(&participant(), record("8")).await.unwrap();
        let result = store.save(&participant(), record("9")).await.unwrap();
        assert_eq!(result.tier, Tier::Primary);

        let remote = primary.load_records(&participant()).await.unwrap();
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].payload.final_answer.as_deref(), Some("9"));

        let loaded = store.load(&participant()).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].final_answer.as_deref(), Some("9"));
    }

    #[tokio::test]
    async fn save_merges_transcript_by_turn_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = TieredStore::new(LocalCache::new(dir.path()));

        let mut first = record("8");
        first.transcript = vec![turn(1, "hi"), turn(2, "I think 8")];
        store.save(&participant(), first).await.unwrap();

        let mut second = record("9");
        second.transcript = vec![turn(2, "I think 8"), turn(3, "actually 9")];
        store.save(&participant(), second).await.unwrap();

        let loaded = store.load(&participant()).await.unwrap();
        let ids: Vec<u64> = loaded[0].transcript.iter().map(|t| t.id.0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn failing_primary_falls_back_to_secondary_with_same_hash() {
        let dir = tempfile::tempdir().unwrap();
        let secondary = memory_tier("secondary").await;
        let store = TieredStore::new(LocalCache::new(dir.path()))
            .with_primary(Arc::new(FailingTier))
            .with_secondary(secondary.clone());

        let result = store.save(&participant(), record("9")).await.unwrap();
        assert_eq!(result.tier, Tier::Secondary);
        // two primary attempts, then one secondary
        assert_eq!(result.attempts, 3);

        let remote = secondary.load_records(&participant()).await.unwrap();
        assert_eq!(remote[0].envelope.payload_hash, result.payload_hash);
        assert_eq!(remote[0].envelope.target_tier, Tier::Secondary);

        let cached: CacheEntry<SessionRecord> = store
            .local()
            .read(&participant(), CacheKey::Record(ItemId(5)))
            .unwrap()
            .unwrap();
        assert_eq!(cached.envelope.payload_hash, result.payload_hash);
        assert_eq!(cached.confirmed_by, Some(Tier::Secondary));

        let loaded = store.load(&participant()).await.unwrap();
        assert_eq!(loaded[0].final_answer.as_deref(), Some("9"));
    }

    #[tokio::test]
    async fn all_remotes_failing_keeps_record_in_local_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = TieredStore::new(LocalCache::new(dir.path()))
            .with_primary(Arc::new(FailingTier))
            .with_secondary(Arc::new(FailingTier));

        let result = store.save(&participant(), record("9")).await.unwrap();
        assert_eq!(result.tier, Tier::LocalCache);
        assert_eq!(result.attempts, 4);

        let loaded = store.load(&participant()).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(payload_hash(&loaded[0]).unwrap(), result.payload_hash);
    }

    #[tokio::test]
    async fn every_tier_failing_is_exhausted() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let store = TieredStore::new(LocalCache::new(file.path())).with_primary(Arc::new(FailingTier));

        let err = store.save(&participant(), record("9")).await.unwrap_err();
        match err {
            Error::Exhausted { participant, failures, .. } => {
                assert_eq!(participant, "p-42");
                assert_eq!(failures.len(), 3);
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn retries_within_a_tier_before_falling_through() {
        let dir = tempfile::tempdir().unwrap();
        let flaky = Arc::new(FlakyTier::new(1).await);
        let store = TieredStore::new(LocalCache::new(dir.path()))
            .with_primary(flaky.clone())
            .with_secondary(memory_tier("secondary").await);

        let result = store.save(&participant(), record("9")).await.unwrap();
        assert_eq!(result.tier, Tier::Primary);
        assert_eq!(result.attempts, 2);

        let remote = flaky.load_records(&participant()).await.unwrap();
        assert_eq!(remote[0].envelope.attempt, 2);
    }

    #[tokio::test]
    async fn load_prefers_most_recent_copy() {
        let dir = tempfile::tempdir().unwrap();
        let primary = memory_tier("primary").await;
        let store = TieredStore::new(LocalCache::new(dir.path())).with_primary(primary.clone());

        store.save(&participant(), record("8")).await.unwrap();

        // A newer copy written straight to the primary by another session.
        let newer = record("10");
        let envelope = PersistenceEnvelope::new(
            Tier::Primary,
            1,
            payload_hash(&newer).unwrap(),
            Utc::now() + chrono::Duration::seconds(60),
        );
        primary.upsert_record(&participant(), &newer, &envelope).await.unwrap();

        let loaded = store.load(&participant()).await.unwrap();
        assert_eq!(loaded[0].final_answer.as_deref(), Some("10"));
    }

    #[tokio::test]
    async fn load_survives_failing_remote() {
        let dir = tempfile::tempdir().unwrap();
        let store = TieredStore::new(LocalCache::new(dir.path())).with_primary(Arc::new(FailingTier));
        store.save(&participant(), record("9")).await.unwrap();

        let loaded = store.load(&participant()).await.unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[tokio::test]
    async fn reconcile_confirms_entries_once_primary_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path());
        let context = assign("p-42", 8);

        let offline = TieredStore::new(cache.clone()).with_primary(Arc::new(FailingTier));
        offline.save(&participant(), record("9")).await.unwrap();

        let primary = memory_tier("primary").await;
        let online = TieredStore::new(cache).with_primary(primary.clone());
        let report = online.reconcile_all(&context).await.unwrap();

        assert!(report.context_flushed);
        assert_eq!(report.retried, 2);
        assert_eq!(report.confirmed, 2);
        assert_eq!(primary.load_records(&participant()).await.unwrap().len(), 1);
        assert!(primary.load_context(&participant()).await.unwrap().is_some());

        let again = online.reconcile_all(&context).await.unwrap();
        assert_eq!(again.retried, 0);
    }

    #[tokio::test]
    async fn reconcile_flushes_advanced_context_locally() {
        let dir = tempfile::tempdir().unwrap();
        let store = TieredStore::new(LocalCache::new(dir.path()));
        let context = assign("p-42", 8);
        store.save_context(&context).await.unwrap();

        let advanced = transition(&context, Stage::PreSurvey).unwrap();
        let report = store.reconcile_all(&advanced).await.unwrap();
        assert!(report.context_flushed);
        assert_eq!(report.retried, 0);

        let loaded = store.load_context(&participant()).await.unwrap().unwrap();
        assert_eq!(loaded.current_stage, Stage::PreSurvey);
    }

    #[tokio::test]
    async fn surveys_roundtrip_through_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let store = TieredStore::new(LocalCache::new(dir.path()))
            .with_primary(memory_tier("primary").await);
        let mut answers = BTreeMap::new();
        answers.insert("enjoyed_math".to_string(), serde_json::json!("agree"));
        let survey = SurveyResponse {
            kind: SurveyKind::Pre,
            answers,
            submitted_at: Utc::now(),
        };

        let result = store.save_survey(&participant(), &survey).await.unwrap();
        assert_eq!(result.tier, Tier::Primary);

        let loaded = store.load_surveys(&participant()).await.unwrap();
        assert_eq!(loaded, vec![survey]);
    }
}
