//! Ordered, non-overlapping agent turns.
//!
//! At most one agent turn is generating or revealing at a time. Further
//! turns wait in a FIFO queue and start only when the active turn settles.
//! Human and system turns are appended immediately and never wait.
//!
//! Generation runs in spawned tasks that report over an `mpsc` channel. The
//! owner drives everything else by calling [`DialogueScheduler::tick`]:
//!
//! ```text
//! tick(now)
//!     ├─ drain generation outcomes   (Pending -> Revealing, or fallback)
//!     ├─ advance reveal              (Revealing -> Settled)
//!     ├─ safety valve                (stuck too long -> forced Settled)
//!     └─ start next queued turn
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::generation::{GenerationOptions, GenerationService};
use super::prompt::PromptBuilder;
use super::roster::AgentRoster;
use crate::config::DialogueConfig;
use crate::error::{DialogueError, GenerationError};
use crate::record::{ConversationTurn, RenderState, SpeakerKind};
use crate::types::{AgentRef, TurnId};

const EVENT_CAPACITY: usize = 256;

/// Why an agent turn was scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnTag {
    /// Answer to a human message.
    Reply,
    /// Interjection from the intervention engine.
    Intervention,
}

/// A queued agent turn.
pub struct AgentTurnSpec {
    pub agent: AgentRef,
    pub prompt: PromptBuilder,
    pub tag: TurnTag,
}

impl AgentTurnSpec {
    pub fn reply(agent: AgentRef, prompt: PromptBuilder) -> Self {
        Self {
            agent,
            prompt,
            tag: TurnTag::Reply,
        }
    }

    pub fn intervention(agent: AgentRef, prompt: PromptBuilder) -> Self {
        Self {
            agent,
            prompt,
            tag: TurnTag::Intervention,
        }
    }
}

impl std::fmt::Debug for AgentTurnSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentTurnSpec")
            .field("agent", &self.agent)
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}

/// Render-state changes published to presentation layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    Appended {
        turn: TurnId,
        speaker: SpeakerKind,
        agent: Option<AgentRef>,
    },
    Revealing {
        turn: TurnId,
        revealed: usize,
        total: usize,
    },
    Settled {
        turn: TurnId,
        forced: bool,
        fallback: bool,
    },
}

/// An agent turn that reached `Settled` during a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettledTurn {
    pub id: TurnId,
    pub agent: AgentRef,
    pub tag: TurnTag,
    pub words: u64,
    pub forced: bool,
    pub fallback: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Revealing { since: Instant },
}

#[derive(Debug)]
struct ActiveTurn {
    id: TurnId,
    index: usize,
    agent: AgentRef,
    tag: TurnTag,
    started: Instant,
    phase: Phase,
}

#[derive(Debug)]
struct GenerationOutcome {
    turn: TurnId,
    result: Result<String, GenerationError>,
}

/// Maps the tokio clock onto wall-clock timestamps for turn records.
#[derive(Debug, Clone, Copy)]
struct SessionClock {
    anchor: Instant,
    anchor_utc: DateTime<Utc>,
}

impl SessionClock {
    fn new(anchor: Instant) -> Self {
        Self {
            anchor,
            anchor_utc: Utc::now(),
        }
    }

    fn at(&self, now: Instant) -> DateTime<Utc> {
        let elapsed = now.saturating_duration_since(self.anchor);
        self.anchor_utc + chrono::Duration::from_std(elapsed).unwrap_or_default()
    }
}

/// Owns the conversation of one lesson session.
pub struct DialogueScheduler {
    roster: Arc<AgentRoster>,
    generator: Arc<dyn GenerationService>,
    config: DialogueConfig,
    turns: Vec<ConversationTurn>,
    next_id: u64,
    active: Option<ActiveTurn>,
    queue: VecDeque<AgentTurnSpec>,
    outcomes_tx: mpsc::UnboundedSender<GenerationOutcome>,
    outcomes_rx: mpsc::UnboundedReceiver<GenerationOutcome>,
    events: broadcast::Sender<TurnEvent>,
    fallback_cursor: HashMap<AgentRef, usize>,
    clock: SessionClock,
    last_activity: Instant,
}

impl DialogueScheduler {
    pub fn new(
        roster: Arc<AgentRoster>,
        generator: Arc<dyn GenerationService>,
        config: DialogueConfig,
        now: Instant,
    ) -> Self {
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            roster,
            generator,
            config,
            turns: Vec::new(),
            next_id: 1,
            active: None,
            queue: VecDeque::new(),
            outcomes_tx,
            outcomes_rx,
            events,
            fallback_cursor: HashMap::new(),
            clock: SessionClock::new(now),
            last_activity: now,
        }
    }

    /// Receive every future [`TurnEvent`].
    pub fn subscribe(&self) -> broadcast::Receiver<TurnEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    #[must_use]
    pub fn turn(&self, id: TurnId) -> Option<&ConversationTurn> {
        self.turns.iter().find(|t| t.id == id)
    }

    #[must_use]
    pub fn roster(&self) -> &Arc<AgentRoster> {
        &self.roster
    }

    /// The turn currently generating or revealing.
    #[must_use]
    pub fn active_turn(&self) -> Option<TurnId> {
        self.active.as_ref().map(|a| a.id)
    }

    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// No turn in flight and nothing queued.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.queue.is_empty()
    }

    /// When a turn was last appended or settled.
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Append a settled human turn. Never waits on agent turns.
    pub fn submit_human_turn(&mut self, body: impl Into<String>, now: Instant) -> TurnId {
        self.append_settled(SpeakerKind::Human, body.into(), now)
    }

    /// Append a settled system turn, such as the problem statement.
    pub fn post_system_turn(&mut self, body: impl Into<String>, now: Instant) -> TurnId {
        self.append_settled(SpeakerKind::System, body.into(), now)
    }

    /// Start an agent reply right away.
    ///
    /// Refused while another agent turn is in flight; use [`chain`] for
    /// ordered multi-turn work.
    ///
    /// [`chain`]: DialogueScheduler::chain
    pub fn schedule_agent_turn(
        &mut self,
        agent: AgentRef,
        prompt: PromptBuilder,
        now: Instant,
    ) -> Result<TurnId, DialogueError> {
        self.schedule(AgentTurnSpec::reply(agent, prompt), now)
    }

    /// Start `spec` right away, refusing if a turn is in flight.
    pub fn schedule(&mut self, spec: AgentTurnSpec, now: Instant) -> Result<TurnId, DialogueError> {
        if !self.roster.contains(&spec.agent) {
            return Err(DialogueError::UnknownAgent(spec.agent));
        }
        if let Some(active) = &self.active {
            return Err(DialogueError::TurnInFlight { active: active.id });
        }
        if !self.queue.is_empty() {
            // Queue is only non-empty while a turn is active; start its head
            // first so FIFO order holds.
            self.start_next(now);
            if let Some(active) = &self.active {
                return Err(DialogueError::TurnInFlight { active: active.id });
            }
        }
        Ok(self.start(spec, now))
    }

    /// Queue `specs` to run one after another.
    ///
    /// Turn *k+1* starts only once turn *k* has settled. Unknown agents are
    /// rejected before anything is queued.
    pub fn chain(&mut self, specs: Vec<AgentTurnSpec>, now: Instant) -> Result<(), DialogueError> {
        if let Some(unknown) = specs.iter().find(|s| !self.roster.contains(&s.agent)) {
            return Err(DialogueError::UnknownAgent(unknown.agent.clone()));
        }
        debug!(count = specs.len(), queued = self.queue.len(), "chaining agent turns");
        self.queue.extend(specs);
        if self.active.is_none() {
            self.start_next(now);
        }
        Ok(())
    }

    /// Advance every in-flight turn to `now`.
    ///
    /// Returns the agent turns that settled during this tick.
    pub fn tick(&mut self, now: Instant) -> Vec<SettledTurn> {
        let mut settled = Vec::new();

        while let Ok(outcome) = self.outcomes_rx.try_recv() {
            self.apply_outcome(outcome, now, &mut settled);
        }

        self.advance_reveal(now, &mut settled);
        self.enforce_ceiling(now, &mut settled);

        if self.active.is_none() {
            self.start_next(now);
        }
        settled
    }

    /// Force-settle the active turn, drop queued turns.
    pub fn unstick(&mut self, now: Instant) -> Vec<SettledTurn> {
        let mut settled = Vec::new();
        let dropped = self.queue.len();
        self.queue.clear();
        if self.active.is_some() {
            self.force_settle(now, &mut settled);
        }
        info!(dropped, settled = settled.len(), "unstuck dialogue");
        settled
    }

    fn append_settled(&mut self, speaker: SpeakerKind, body: String, now: Instant) -> TurnId {
        let id = self.allocate_id();
        let at = self.clock.at(now);
        let revealed = body.chars().count();
        self.turns.push(ConversationTurn {
            id,
            speaker,
            agent: None,
            body,
            created_at: at,
            render_state: RenderState::Settled,
            revealed,
            settled_at: Some(at),
            fallback: false,
        });
        self.last_activity = now;
        self.publish(TurnEvent::Appended {
            turn: id,
            speaker,
            agent: None,
        });
        self.publish(TurnEvent::Settled {
            turn: id,
            forced: false,
            fallback: false,
        });
        id
    }

    fn allocate_id(&mut self) -> TurnId {
        let id = TurnId(self.next_id);
        self.next_id += 1;
        id
    }

    fn start_next(&mut self, now: Instant) {
        if let Some(spec) = self.queue.pop_front() {
            self.start(spec, now);
        }
    }

    fn start(&mut self, spec: AgentTurnSpec, now: Instant) -> TurnId {
        debug_assert!(self.active.is_none(), "agent turns must not overlap");

        let AgentTurnSpec { agent, prompt, tag } = spec;
        let prompt = prompt(&self.turns);
        let options = match self.roster.get(&agent) {
            Some(persona) => GenerationOptions {
                persona: persona.display_name.clone(),
                model_hint: persona.model_hint.clone(),
            },
            None => GenerationOptions {
                persona: agent.to_string(),
                model_hint: None,
            },
        };

        let id = self.allocate_id();
        self.turns.push(ConversationTurn {
            id,
            speaker: SpeakerKind::Agent,
            agent: Some(agent.clone()),
            body: String::new(),
            created_at: self.clock.at(now),
            render_state: RenderState::Pending,
            revealed: 0,
            settled_at: None,
            fallback: false,
        });
        self.active = Some(ActiveTurn {
            id,
            index: self.turns.len() - 1,
            agent: agent.clone(),
            tag,
            started: now,
            phase: Phase::Pending,
        });
        self.last_activity = now;
        self.publish(TurnEvent::Appended {
            turn: id,
            speaker: SpeakerKind::Agent,
            agent: Some(agent.clone()),
        });

        let generator = Arc::clone(&self.generator);
        let tx = self.outcomes_tx.clone();
        tokio::spawn(async move {
            let result = generator.generate(prompt, options).await;
            // Receiver gone means the session ended; nothing to report to.
            let _ = tx.send(GenerationOutcome { turn: id, result });
        });

        debug!(turn = %id, agent = %agent, ?tag, "agent turn started");
        id
    }

    fn apply_outcome(&mut self, outcome: GenerationOutcome, now: Instant, settled: &mut Vec<SettledTurn>) {
        let is_pending_target = matches!(
            &self.active,
            Some(active) if active.id == outcome.turn && active.phase == Phase::Pending
        );
        if !is_pending_target {
            debug!(turn = %outcome.turn, "ignoring late generation outcome");
            return;
        }

        match outcome.result {
            Ok(text) if !text.trim().is_empty() => {
                let total = text.chars().count();
                if let Some(active) = self.active.as_mut() {
                    active.phase = Phase::Revealing { since: now };
                    let turn = &mut self.turns[active.index];
                    turn.body = text;
                    turn.render_state = RenderState::Revealing;
                    turn.revealed = 0;
                }
                self.publish(TurnEvent::Revealing {
                    turn: outcome.turn,
                    revealed: 0,
                    total,
                });
                // A zero-length reveal window settles in the same tick.
                self.advance_reveal(now, settled);
            }
            Ok(_) => {
                warn!(turn = %outcome.turn, error = %GenerationError::EmptyResponse, "generation failed, using fallback");
                self.settle_with_fallback(now, false, settled);
            }
            Err(e) => {
                warn!(turn = %outcome.turn, error = %e, "generation failed, using fallback");
                self.settle_with_fallback(now, false, settled);
            }
        }
    }

    fn advance_reveal(&mut self, now: Instant, settled: &mut Vec<SettledTurn>) {
        let Some(active) = &self.active else {
            return;
        };
        let Phase::Revealing { since } = active.phase else {
            return;
        };

        let turn = &mut self.turns[active.index];
        let total = turn.body.chars().count();
        let rate = self.config.reveal_chars_per_second;
        let target = if rate <= 0.0 {
            total
        } else {
            let elapsed = now.saturating_duration_since(since).as_secs_f64();
            ((elapsed * rate).floor() as usize).min(total)
        };

        if target >= total {
            self.settle_active(now, false, false, settled);
        } else if target > turn.revealed {
            turn.revealed = target;
            let id = turn.id;
            self.publish(TurnEvent::Revealing {
                turn: id,
                revealed: target,
                total,
            });
        }
    }

    fn enforce_ceiling(&mut self, now: Instant, settled: &mut Vec<SettledTurn>) {
        let Some(active) = &self.active else {
            return;
        };
        if now.saturating_duration_since(active.started) < self.config.settle_ceiling() {
            return;
        }
        warn!(
            turn = %active.id,
            agent = %active.agent,
            ceiling_secs = self.config.settle_ceiling_seconds,
            "turn exceeded settle ceiling, forcing settle"
        );
        self.force_settle(now, settled);
    }

    /// Settle the active turn with whatever text is best available.
    fn force_settle(&mut self, now: Instant, settled: &mut Vec<SettledTurn>) {
        let Some(active) = &self.active else {
            return;
        };
        match active.phase {
            Phase::Revealing { .. } => self.settle_active(now, true, false, settled),
            Phase::Pending => self.settle_with_fallback(now, true, settled),
        }
    }

    fn settle_with_fallback(&mut self, now: Instant, forced: bool, settled: &mut Vec<SettledTurn>) {
        let Some(active) = &self.active else {
            return;
        };
        let cursor = self.fallback_cursor.entry(active.agent.clone()).or_insert(0);
        let line = match self.roster.get(&active.agent) {
            Some(persona) => persona.fallback_line(*cursor).to_string(),
            None => super::roster::GENERIC_FALLBACK.to_string(),
        };
        *cursor += 1;
        self.turns[active.index].body = line;
        self.settle_active(now, forced, true, settled);
    }

    fn settle_active(
        &mut self,
        now: Instant,
        forced: bool,
        fallback: bool,
        settled: &mut Vec<SettledTurn>,
    ) {
        let Some(active) = self.active.take() else {
            return;
        };
        let at = self.clock.at(now);
        let turn = &mut self.turns[active.index];
        turn.render_state = RenderState::Settled;
        turn.revealed = turn.body.chars().count();
        turn.settled_at = Some(at);
        turn.fallback = fallback;
        let words = turn.word_count();
        self.last_activity = now;

        debug!(turn = %active.id, agent = %active.agent, forced, fallback, "agent turn settled");
        self.publish(TurnEvent::Settled {
            turn: active.id,
            forced,
            fallback,
        });
        settled.push(SettledTurn {
            id: active.id,
            agent: active.agent,
            tag: active.tag,
            words,
            forced,
            fallback,
        });
    }

    fn publish(&self, event: TurnEvent) {
        // No subscribers is fine; presentation layers are optional.
        let _ = self.events.send(event);
    }
}

impl std::fmt::Debug for DialogueScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialogueScheduler")
            .field("generator", &self.generator.name())
            .field("turns", &self.turns.len())
            .field("active", &self.active)
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}
