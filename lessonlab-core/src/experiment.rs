//! Orchestration facade tying assignment, stages, lessons and storage
//! together for one participant.
//!
//! [`Experiment`] owns the participant context. Every stage change goes
//! through [`Experiment::advance`], which also reconciles the storage
//! tiers, so a participant's progress is on disk before the next stage
//! begins.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::assignment::{self, ParticipantContext};
use crate::config::ExperimentConfig;
use crate::dialogue::GenerationService;
use crate::error::{Error, Result};
use crate::lesson::{LessonOutcome, LessonSession};
use crate::record::{RecordPhase, SessionRecord, SurveyKind, SurveyResponse};
use crate::stage::{Stage, transition};
use crate::storage::{SaveResult, TieredStore};
use crate::types::ParticipantId;

/// Answer to the final-test item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FinalTestSubmission {
    pub item_text: String,
    pub answer: String,
    pub work_area: String,
    pub is_correct: Option<bool>,
    pub elapsed_seconds: f64,
    pub timed_out: bool,
}

/// One participant's run through the experiment.
pub struct Experiment {
    config: ExperimentConfig,
    store: TieredStore,
    generator: Arc<dyn GenerationService>,
    context: ParticipantContext,
}

impl Experiment {
    /// Assign a participant (or a generated development id) and persist the
    /// new context.
    pub async fn start(
        config: ExperimentConfig,
        store: TieredStore,
        generator: Arc<dyn GenerationService>,
        participant: Option<&str>,
    ) -> Result<Self> {
        let pool = config.assignment.item_pool_size;
        let context = match participant {
            Some(raw) => assignment::assign(raw, pool),
            None => assignment::assign_id(ParticipantId::generate(), pool),
        };
        store.save_context(&context).await?;
        Ok(Self {
            config,
            store,
            generator,
            context,
        })
    }

    /// Reload a participant's stored context.
    ///
    /// Assignment is recomputed (and persisted) when no tier has a copy.
    /// Assignment is deterministic, so the recomputed context matches the
    /// lost one apart from its stage.
    pub async fn resume(
        config: ExperimentConfig,
        store: TieredStore,
        generator: Arc<dyn GenerationService>,
        participant: &str,
    ) -> Result<Self> {
        let pool = config.assignment.item_pool_size;
        let stored = match ParticipantId::parse(participant) {
            Ok(id) => store.load_context(&id).await?,
            Err(_) => None,
        };

        let context = match stored {
            Some(context) => {
                info!(
                    participant = %context.participant_id,
                    stage = %context.current_stage,
                    "resumed participant"
                );
                context
            }
            None => {
                let context = assignment::assign(participant, pool);
                store.save_context(&context).await?;
                context
            }
        };

        Ok(Self {
            config,
            store,
            generator,
            context,
        })
    }

    #[must_use]
    pub fn context(&self) -> &ParticipantContext {
        &self.context
    }

    #[must_use]
    pub fn participant(&self) -> &ParticipantId {
        &self.context.participant_id
    }

    #[must_use]
    pub fn stage(&self) -> Stage {
        self.context.current_stage
    }

    #[must_use]
    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &TieredStore {
        &self.store
    }

    // === Stage machine ===

    /// Move to `target`, which must be the next stage.
    ///
    /// Storage is reconciled after every accepted transition. Reconcile
    /// problems are logged and left for the next pass.
    #[instrument(skip(self), fields(participant = %self.context.participant_id), level = "debug")]
    pub async fn advance(&mut self, target: Stage) -> Result<&ParticipantContext> {
        self.context = transition(&self.context, target)?;
        if let Err(e) = self.store.reconcile_all(&self.context).await {
            warn!(
                participant = %self.context.participant_id,
                stage = %self.context.current_stage,
                error = %e,
                "reconcile after transition failed"
            );
        }
        Ok(&self.context)
    }

    /// Discard the current context and start over at consent.
    pub async fn reset(&mut self, participant: Option<&str>) -> Result<&ParticipantContext> {
        let previous = self.context.participant_id.clone();
        self.context = assignment::reset(participant, self.config.assignment.item_pool_size);
        info!(
            previous = %previous,
            participant = %self.context.participant_id,
            "participant reset"
        );
        self.store.save_context(&self.context).await?;
        Ok(&self.context)
    }

    // === Lesson ===

    /// Start the lesson on the assigned lesson item.
    pub fn begin_lesson(&self, item_text: impl Into<String>, now: Instant) -> Result<LessonSession> {
        self.require_stage(Stage::Lesson)?;
        Ok(LessonSession::new(
            &self.context,
            item_text,
            Arc::clone(&self.generator),
            &self.config,
            now,
        ))
    }

    /// Finish `session` and save its record.
    pub async fn complete_lesson(
        &self,
        session: LessonSession,
        outcome: LessonOutcome,
        now: Instant,
    ) -> Result<SaveResult> {
        self.require_stage(Stage::Lesson)?;
        let record = session.finish(outcome, now);
        Ok(self.store.save(&self.context.participant_id, record).await?)
    }

    // === Final test and surveys ===

    /// Save the final-test answer for the assigned final-test item.
    pub async fn record_final_test(&self, submission: FinalTestSubmission) -> Result<SaveResult> {
        self.require_stage(Stage::FinalTest)?;

        let elapsed = submission.elapsed_seconds;
        if !elapsed.is_finite() || elapsed < 0.0 {
            return Err(Error::InvalidElapsed(elapsed));
        }
        let ended_at = Utc::now();
        // Saturating cast; out-of-range spans are rejected below.
        let started_at = chrono::Duration::try_milliseconds((elapsed * 1000.0) as i64)
            .and_then(|span| ended_at.checked_sub_signed(span))
            .ok_or(Error::InvalidElapsed(elapsed))?;
        let mut record = SessionRecord::new(
            self.context.items.final_test,
            submission.item_text,
            RecordPhase::FinalTest,
            self.context.condition,
            started_at,
        );
        record.ended_at = Some(ended_at);
        record.elapsed_seconds = submission.elapsed_seconds;
        record.final_answer = Some(submission.answer);
        record.work_area = submission.work_area;
        record.is_correct = submission.is_correct;
        record.timed_out = submission.timed_out;

        info!(
            participant = %self.context.participant_id,
            item = %record.item_id,
            timed_out = record.timed_out,
            "final test recorded"
        );
        Ok(self.store.save(&self.context.participant_id, record).await?)
    }

    /// Save the pre- or post-survey, each only during its own stage.
    pub async fn save_survey(
        &self,
        kind: SurveyKind,
        answers: BTreeMap<String, serde_json::Value>,
    ) -> Result<SaveResult> {
        let expected = match kind {
            SurveyKind::Pre => Stage::PreSurvey,
            SurveyKind::Post => Stage::PostSurvey,
        };
        self.require_stage(expected)?;

        let survey = SurveyResponse {
            kind,
            answers,
            submitted_at: Utc::now(),
        };
        Ok(self.store.save_survey(&self.context.participant_id, &survey).await?)
    }

    // === Queries ===

    pub async fn records(&self) -> Result<Vec<SessionRecord>> {
        Ok(self.store.load(&self.context.participant_id).await?)
    }

    pub async fn surveys(&self) -> Result<Vec<SurveyResponse>> {
        Ok(self.store.load_surveys(&self.context.participant_id).await?)
    }

    /// When the participant was first assigned.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.context.created_at
    }

    fn require_stage(&self, expected: Stage) -> Result<()> {
        let actual = self.context.current_stage;
        if actual != expected {
            return Err(Error::WrongStage { expected, actual });
        }
        Ok(())
    }
}

impl std::fmt::Debug for Experiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Experiment")
            .field("participant", &self.context.participant_id)
            .field("stage", &self.context.current_stage)
            .field("condition", &self.context.condition)
            .field("generator", &self.generator.name())
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::dialogue::CannedGenerator;
    use crate::error::StageTransitionError;
    use crate::storage::{LocalCache, Tier, TursoSessionStore};

    async fn store(dir: &TempDir) -> TieredStore {
        let primary = TursoSessionStore::new_memory("primary").await.unwrap();
        TieredStore::new(LocalCache::new(dir.path())).with_primary(Arc::new(primary))
    }

    async fn experiment(dir: &TempDir, id: &str) -> Experiment {
        Experiment::start(
            ExperimentConfig::default(),
            store(dir).await,
            Arc::new(CannedGenerator::default()),
            Some(id),
        )
        .await
        .unwrap()
    }

    async fn walk_to(exp: &mut Experiment, target: Stage) {
        while exp.stage() != target {
            let next = exp.stage().next().unwrap();
            exp.advance(next).await.unwrap();
        }
    }

    #[tokio::test]
    async fn start_assigns_and_persists_context() {
        let dir = TempDir::new().unwrap();
        let exp = experiment(&dir, "P0001").await;
        assert_eq!(exp.stage(), Stage::Consent);

        let stored = exp.store().load_context(exp.participant()).await.unwrap();
        assert_eq!(stored.as_ref(), Some(exp.context()));
    }

    #[tokio::test]
    async fn start_without_id_generates_one() {
        let dir = TempDir::new().unwrap();
        let exp = Experiment::start(
            ExperimentConfig::default(),
            store(&dir).await,
            Arc::new(CannedGenerator::default()),
            None,
        )
        .await
        .unwrap();
        assert!(exp.participant().is_generated());
    }

    #[tokio::test]
    async fn resume_picks_up_stored_stage() {
        let dir = TempDir::new().unwrap();
        let mut exp = experiment(&dir, "P0002").await;
        walk_to(&mut exp, Stage::Lesson).await;
        let condition = exp.context().condition;

        // Local cache only: the in-memory primary does not outlive `exp`.
        let resumed = Experiment::resume(
            ExperimentConfig::default(),
            TieredStore::new(LocalCache::new(dir.path())),
            Arc::new(CannedGenerator::default()),
            "P0002",
        )
        .await
        .unwrap();
        assert_eq!(resumed.stage(), Stage::Lesson);
        assert_eq!(resumed.context().condition, condition);
    }

    #[tokio::test]
    async fn resume_unknown_participant_recomputes_assignment() {
        let dir = TempDir::new().unwrap();
        let exp = Experiment::resume(
            ExperimentConfig::default(),
            store(&dir).await,
            Arc::new(CannedGenerator::default()),
            "P0003",
        )
        .await
        .unwrap();
        let fresh = assignment::assign("P0003", ExperimentConfig::default().assignment.item_pool_size);
        assert_eq!(exp.stage(), Stage::Consent);
        assert_eq!(exp.context().condition, fresh.condition);
        assert_eq!(exp.context().items, fresh.items);
    }

    #[tokio::test]
    async fn invalid_advance_is_rejected_and_stage_kept() {
        let dir = TempDir::new().unwrap();
        let mut exp = experiment(&dir, "P0004").await;
        let err = exp.advance(Stage::FinalTest).await.unwrap_err();
        assert!(matches!(
            err,
            Error::StageTransition(StageTransitionError {
                from: Stage::Consent,
                to: Stage::FinalTest
            })
        ));
        assert_eq!(exp.stage(), Stage::Consent);
    }

    #[tokio::test]
    async fn advance_reconciles_context_to_primary() {
        let dir = TempDir::new().unwrap();
        let mut exp = experiment(&dir, "P0005").await;
        exp.advance(Stage::PreSurvey).await.unwrap();

        let entry = exp
            .store()
            .local()
            .read::<ParticipantContext>(exp.participant(), crate::storage::CacheKey::Context)
            .unwrap()
            .unwrap();
        assert_eq!(entry.payload.current_stage, Stage::PreSurvey);
        assert_eq!(entry.confirmed_by, Some(Tier::Primary));
    }

    #[tokio::test]
    async fn lesson_requires_lesson_stage() {
        let dir = TempDir::new().unwrap();
        let exp = experiment(&dir, "P0006").await;
        let err = exp.begin_lesson("3/4 of 12?", Instant::now()).unwrap_err();
        assert!(matches!(
            err,
            Error::WrongStage {
                expected: Stage::Lesson,
                actual: Stage::Consent
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn completed_lesson_is_stored_for_assigned_item() {
        let dir = TempDir::new().unwrap();
        let mut exp = experiment(&dir, "P0007").await;
        walk_to(&mut exp, Stage::Lesson).await;

        let mut session = exp.begin_lesson("What is 3/4 of 12?", Instant::now()).unwrap();
        session.submit_initial_answer("9", Instant::now()).unwrap();
        session.run_for(Duration::from_secs(10)).await;

        let saved = exp
            .complete_lesson(
                session,
                LessonOutcome {
                    final_answer: Some("9".to_string()),
                    is_correct: Some(true),
                    timed_out: false,
                },
                Instant::now(),
            )
            .await
            .unwrap();
        assert_eq!(saved.tier, Tier::Primary);

        let records = exp.records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].item_id, exp.context().items.lesson);
        assert_eq!(records[0].phase, RecordPhase::Lesson);
        assert_eq!(records[0].final_answer.as_deref(), Some("9"));
    }

    #[tokio::test]
    async fn final_test_uses_final_item() {
        let dir = TempDir::new().unwrap();
        let mut exp = experiment(&dir, "P0008").await;
        assert!(matches!(
            exp.record_final_test(FinalTestSubmission::default()).await,
            Err(Error::WrongStage { .. })
        ));

        walk_to(&mut exp, Stage::FinalTest).await;
        exp.record_final_test(FinalTestSubmission {
            item_text: "What is 2/3 of 9?".to_string(),
            answer: "6".to_string(),
            is_correct: Some(true),
            elapsed_seconds: 42.0,
            ..Default::default()
        })
        .await
        .unwrap();

        let records = exp.records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].item_id, exp.context().items.final_test);
        assert_eq!(records[0].phase, RecordPhase::FinalTest);
        assert_eq!(records[0].elapsed_seconds, 42.0);
    }

    #[tokio::test]
    async fn final_test_rejects_unusable_elapsed_time() {
        let dir = TempDir::new().unwrap();
        let mut exp = experiment(&dir, "P0011").await;
        walk_to(&mut exp, Stage::FinalTest).await;

        for elapsed in [1e300, f64::NEG_INFINITY, f64::INFINITY, f64::NAN, -1.0] {
            let result = exp
                .record_final_test(FinalTestSubmission {
                    answer: "6".to_string(),
                    elapsed_seconds: elapsed,
                    ..Default::default()
                })
                .await;
            assert!(matches!(result, Err(Error::InvalidElapsed(_))), "elapsed {elapsed}");
        }
        assert!(exp.records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn surveys_are_bound_to_their_stage() {
        let dir = TempDir::new().unwrap();
        let mut exp = experiment(&dir, "P0009").await;
        let answers = BTreeMap::from([("confidence".to_string(), json!(4))]);

        assert!(exp.save_survey(SurveyKind::Pre, answers.clone()).await.is_err());
        exp.advance(Stage::PreSurvey).await.unwrap();
        exp.save_survey(SurveyKind::Pre, answers.clone()).await.unwrap();
        assert!(exp.save_survey(SurveyKind::Post, answers).await.is_err());

        let surveys = exp.surveys().await.unwrap();
        assert_eq!(surveys.len(), 1);
        assert_eq!(surveys[0].kind, SurveyKind::Pre);
        assert_eq!(surveys[0].answers["confidence"], json!(4));
    }

    #[tokio::test]
    async fn reset_returns_to_consent() {
        let dir = TempDir::new().unwrap();
        let mut exp = experiment(&dir, "P0010").await;
        walk_to(&mut exp, Stage::Break).await;

        let context = exp.reset(None).await.unwrap();
        assert_eq!(context.current_stage, Stage::Consent);
        assert!(context.participant_id.is_generated());

        exp.reset(Some("P0010")).await.unwrap();
        assert_eq!(exp.participant().as_str(), "P0010");
        assert_eq!(exp.stage(), Stage::Consent);
    }
}
