//! One participant's lesson: conversation plus intervention watching.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::assignment::ParticipantContext;
use crate::condition::Condition;
use crate::config::ExperimentConfig;
use crate::dialogue::{
    AgentRoster, AgentTurnSpec, DialogueScheduler, GenerationService, SettledTurn, TurnEvent,
    TurnTag, window_prompt,
};
use crate::error::DialogueError;
use crate::intervention::{InterventionEngine, InterventionState};
use crate::record::{ConversationTurn, RecordPhase, SessionRecord};
use crate::types::{ItemId, ParticipantId, TurnId};

/// How a lesson ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LessonOutcome {
    /// Final answer; the initial answer is used when absent.
    pub final_answer: Option<String>,
    pub is_correct: Option<bool>,
    pub timed_out: bool,
}

/// The single authoritative in-memory object for a running lesson.
///
/// All mutation goes through `&mut self`; call [`tick`](Self::tick)
/// regularly (or use [`run_for`](Self::run_for)) to drive reveal, the
/// safety valve, and interventions.
#[derive(Debug)]
pub struct LessonSession {
    participant: ParticipantId,
    condition: Condition,
    item_id: ItemId,
    item_text: String,
    roster: Arc<AgentRoster>,
    scheduler: DialogueScheduler,
    intervention: InterventionEngine,
    prompt_window: usize,
    tick_every: Duration,
    started_at: DateTime<Utc>,
    started: Instant,
    initial_answer: Option<String>,
    work_area: String,
}

impl LessonSession {
    /// Start a lesson on the participant's assigned lesson item.
    ///
    /// The problem statement is posted as the first (system) turn.
    pub fn new(
        context: &ParticipantContext,
        item_text: impl Into<String>,
        generator: Arc<dyn GenerationService>,
        config: &ExperimentConfig,
        now: Instant,
    ) -> Self {
        let roster = Arc::new(AgentRoster::for_condition(context.condition));
        let intervention =
            InterventionEngine::new(config.intervention.clone(), Arc::clone(&roster), now);
        Self::build(context, item_text.into(), roster, generator, config, intervention, now)
    }

    /// Same as [`new`](Self::new) with seeded intervention peer selection.
    pub fn with_seed(
        context: &ParticipantContext,
        item_text: impl Into<String>,
        generator: Arc<dyn GenerationService>,
        config: &ExperimentConfig,
        now: Instant,
        seed: u64,
    ) -> Self {
        let roster = Arc::new(AgentRoster::for_condition(context.condition));
        let intervention = InterventionEngine::with_seed(
            config.intervention.clone(),
            Arc::clone(&roster),
            now,
            seed,
        );
        Self::build(context, item_text.into(), roster, generator, config, intervention, now)
    }

    fn build(
        context: &ParticipantContext,
        item_text: String,
        roster: Arc<AgentRoster>,
        generator: Arc<dyn GenerationService>,
        config: &ExperimentConfig,
        intervention: InterventionEngine,
        now: Instant,
    ) -> Self {
        let mut scheduler = DialogueScheduler::new(
            Arc::clone(&roster),
            generator,
            config.dialogue.clone(),
            now,
        );
        scheduler.post_system_turn(item_text.clone(), now);

        info!(
            participant = %context.participant_id,
            condition = %context.condition,
            item = %context.items.lesson,
            "lesson started"
        );

        Self {
            participant: context.participant_id.clone(),
            condition: context.condition,
            item_id: context.items.lesson,
            item_text,
            roster,
            scheduler,
            intervention,
            prompt_window: config.dialogue.prompt_window,
            tick_every: config.dialogue.tick(),
            started_at: Utc::now(),
            started: now,
            initial_answer: None,
            work_area: String::new(),
        }
    }

    #[must_use]
    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    #[must_use]
    pub fn condition(&self) -> Condition {
        self.condition
    }

    #[must_use]
    pub fn item_id(&self) -> ItemId {
        self.item_id
    }

    #[must_use]
    pub fn transcript(&self) -> &[ConversationTurn] {
        self.scheduler.turns()
    }

    #[must_use]
    pub fn scheduler(&self) -> &DialogueScheduler {
        &self.scheduler
    }

    #[must_use]
    pub fn intervention_state(&self) -> &InterventionState {
        self.intervention.state()
    }

    #[must_use]
    pub fn interventions_fired(&self) -> u32 {
        self.intervention.fired()
    }

    #[must_use]
    pub fn is_locked_in(&self) -> bool {
        self.initial_answer.is_some()
    }

    #[must_use]
    pub fn initial_answer(&self) -> Option<&str> {
        self.initial_answer.as_deref()
    }

    #[must_use]
    pub fn work_area(&self) -> &str {
        &self.work_area
    }

    /// Whether the human may post right now.
    #[must_use]
    pub fn input_enabled(&self) -> bool {
        !self.intervention.is_armed()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TurnEvent> {
        self.scheduler.subscribe()
    }

    /// Lock in the human's first answer and open the discussion.
    ///
    /// Interventions become eligible from this point. A second call is
    /// treated as an ordinary message.
    pub fn submit_initial_answer(
        &mut self,
        answer: impl Into<String>,
        now: Instant,
    ) -> Result<TurnId, DialogueError> {
        let answer = answer.into();
        if self.initial_answer.is_some() {
            return self.submit_message(answer, now);
        }
        self.initial_answer = Some(answer.clone());
        self.intervention.lock_in(now);
        info!(participant = %self.participant, item = %self.item_id, "initial answer locked in");
        self.post_human(format!("My answer: {}", answer), now)
    }

    /// Post a human message; the condition's responders answer in order.
    pub fn submit_message(
        &mut self,
        body: impl Into<String>,
        now: Instant,
    ) -> Result<TurnId, DialogueError> {
        if !self.input_enabled() {
            return Err(DialogueError::InputPaused);
        }
        self.post_human(body.into(), now)
    }

    pub fn update_work_area(&mut self, text: impl Into<String>) {
        self.work_area = text.into();
    }

    /// Drive reveal, the safety valve, and intervention checks to `now`.
    pub fn tick(&mut self, now: Instant) -> Vec<SettledTurn> {
        let settled = self.scheduler.tick(now);
        self.absorb(&settled, now);

        if let Some(fired) = self.intervention.check(now) {
            let persona_prompt = self
                .roster
                .get(&fired.agent)
                .map(|p| p.intervention_prompt.clone());
            let prompt = window_prompt(
                Arc::clone(&self.roster),
                fired.agent.clone(),
                persona_prompt,
                self.prompt_window,
            );
            let spec = AgentTurnSpec::intervention(fired.agent, prompt);
            if let Err(e) = self.scheduler.chain(vec![spec], now) {
                warn!(error = %e, "could not schedule intervention");
                self.intervention.disarm(now);
            }
        }
        settled
    }

    /// Clear every stuck turn and re-enable human input.
    pub fn unstick(&mut self, now: Instant) -> Vec<SettledTurn> {
        let settled = self.scheduler.unstick(now);
        self.absorb(&settled, now);
        self.intervention.disarm(now);
        settled
    }

    /// Tick at the configured interval for `duration` of tokio time.
    pub async fn run_for(&mut self, duration: Duration) -> Vec<SettledTurn> {
        let deadline = Instant::now() + duration;
        let mut settled = Vec::new();
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(self.tick_every.min(deadline - now)).await;
            settled.extend(self.tick(Instant::now()));
        }
        settled
    }

    /// End the lesson and produce its record.
    ///
    /// Any turn still in flight is force-settled first.
    pub fn finish(mut self, outcome: LessonOutcome, now: Instant) -> SessionRecord {
        if !self.scheduler.is_idle() {
            self.scheduler.unstick(now);
        }
        let elapsed = now.saturating_duration_since(self.started);
        let mut record = SessionRecord::new(
            self.item_id,
            self.item_text,
            RecordPhase::Lesson,
            self.condition,
            self.started_at,
        );
        record.ended_at = Some(
            self.started_at + chrono::Duration::from_std(elapsed).unwrap_or_default(),
        );
        record.elapsed_seconds = elapsed.as_secs_f64();
        record.final_answer = outcome.final_answer.or(self.initial_answer);
        record.work_area = self.work_area;
        record.transcript = self.scheduler.turns().to_vec();
        record.is_correct = outcome.is_correct;
        record.timed_out = outcome.timed_out;

        info!(
            participant = %self.participant,
            item = %self.item_id,
            turns = record.transcript.len(),
            elapsed_secs = record.elapsed_seconds,
            "lesson finished"
        );
        record
    }

    fn post_human(&mut self, body: String, now: Instant) -> Result<TurnId, DialogueError> {
        let words = body.split_whitespace().count() as u64;
        let id = self.scheduler.submit_human_turn(body, now);
        self.intervention.record_activity(words, now);

        let specs: Vec<AgentTurnSpec> = self
            .roster
            .responders()
            .into_iter()
            .map(|agent| {
                let prompt =
                    window_prompt(Arc::clone(&self.roster), agent.clone(), None, self.prompt_window);
                AgentTurnSpec::reply(agent, prompt)
            })
            .collect();
        if !specs.is_empty() {
            self.scheduler.chain(specs, now)?;
        }
        Ok(id)
    }

    fn absorb(&mut self, settled: &[SettledTurn], now: Instant) {
        for turn in settled {
            self.intervention.record_activity(turn.words, now);
            if turn.tag == TurnTag::Intervention && self.intervention.is_armed() {
                debug!(turn = %turn.id, "intervention turn settled");
                self.intervention.complete(now);
            }
        }
    }
}
