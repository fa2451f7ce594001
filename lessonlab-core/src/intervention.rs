//! Threshold-driven agent interjections.
//!
//! The engine watches two counters during the locked-in part of a lesson:
//!
//! - words across settled human and agent turns since the last reset
//! - time since the last turn
//!
//! A periodic check compares them with the configured thresholds. When one
//! is crossed the engine arms itself, resets the word count, and names the
//! agent that should speak. It stays armed until that turn settles, so a
//! second intervention can never start on top of the first.
//!
//! ```text
//! Dormant ──lock_in──► Watching ──threshold──► Armed ──complete──► Watching
//! ```

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::InterventionConfig;
use crate::dialogue::AgentRoster;
use crate::types::AgentRef;

/// Live counters for one lesson session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterventionState {
    /// True from the moment an intervention fires until its turn settles.
    pub armed: bool,
    pub word_count: u64,
    pub last_activity_at: Instant,
    pub last_reset_at: Instant,
}

/// Which threshold fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterventionTrigger {
    WordCount,
    Idle,
}

impl InterventionTrigger {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WordCount => "word-count",
            Self::Idle => "idle",
        }
    }
}

/// A fired intervention: who should speak and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intervention {
    pub trigger: InterventionTrigger,
    pub agent: AgentRef,
}

/// Decides when an agent should interject.
#[derive(Debug)]
pub struct InterventionEngine {
    config: InterventionConfig,
    roster: Arc<AgentRoster>,
    state: InterventionState,
    locked_in: bool,
    last_check: Instant,
    fired: u32,
    rng: StdRng,
}

impl InterventionEngine {
    /// A dormant engine; call [`lock_in`](Self::lock_in) to start watching.
    pub fn new(config: InterventionConfig, roster: Arc<AgentRoster>, now: Instant) -> Self {
        Self::with_rng(config, roster, now, StdRng::from_entropy())
    }

    /// Same as [`new`](Self::new) with a seeded peer selection.
    pub fn with_seed(
        config: InterventionConfig,
        roster: Arc<AgentRoster>,
        now: Instant,
        seed: u64,
    ) -> Self {
        Self::with_rng(config, roster, now, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        config: InterventionConfig,
        roster: Arc<AgentRoster>,
        now: Instant,
        rng: StdRng,
    ) -> Self {
        Self {
            config,
            roster,
            state: InterventionState {
                armed: false,
                word_count: 0,
                last_activity_at: now,
                last_reset_at: now,
            },
            locked_in: false,
            last_check: now,
            fired: 0,
            rng,
        }
    }

    #[must_use]
    pub fn state(&self) -> &InterventionState {
        &self.state
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.state.armed
    }

    /// Not yet locked in, or disabled by configuration.
    #[must_use]
    pub fn is_dormant(&self) -> bool {
        !self.locked_in || !self.config.enabled
    }

    /// Interventions fired so far.
    #[must_use]
    pub fn fired(&self) -> u32 {
        self.fired
    }

    /// Start watching. Counters start from zero at `now`.
    pub fn lock_in(&mut self, now: Instant) {
        if self.locked_in {
            return;
        }
        self.locked_in = true;
        self.state.word_count = 0;
        self.state.last_activity_at = now;
        self.state.last_reset_at = now;
        self.last_check = now;
        debug!("intervention engine locked in");
    }

    /// A turn settled with `words` words.
    pub fn record_activity(&mut self, words: u64, now: Instant) {
        self.state.last_activity_at = now;
        if self.locked_in {
            self.state.word_count = self.state.word_count.saturating_add(words);
        }
    }

    /// Compare counters with thresholds, at most once per check interval.
    ///
    /// Word count wins when both thresholds are crossed.
    pub fn check(&mut self, now: Instant) -> Option<Intervention> {
        if self.is_dormant() || self.state.armed || self.roster.is_empty() {
            return None;
        }
        if now.saturating_duration_since(self.last_check) < self.config.check_interval() {
            return None;
        }
        self.last_check = now;

        let trigger = if self.state.word_count >= self.config.word_threshold {
            InterventionTrigger::WordCount
        } else if now.saturating_duration_since(self.state.last_activity_at)
            >= self.config.idle_threshold()
        {
            InterventionTrigger::Idle
        } else {
            return None;
        };

        let agent = self.select_agent(trigger)?;
        self.state.armed = true;
        let words = self.state.word_count;
        self.state.word_count = 0;
        self.state.last_reset_at = now;
        self.fired += 1;
        info!(
            trigger = trigger.as_str(),
            agent = %agent,
            words,
            fired = self.fired,
            "intervention fired"
        );
        Some(Intervention { trigger, agent })
    }

    /// The intervention turn settled; resume watching.
    pub fn complete(&mut self, now: Instant) {
        debug_assert!(self.state.armed, "completed an intervention that never fired");
        self.state.armed = false;
        self.state.last_activity_at = now;
        self.last_check = now;
    }

    /// Drop an armed intervention without waiting for its turn.
    pub fn disarm(&mut self, now: Instant) {
        if self.state.armed {
            debug!("intervention disarmed");
            self.state.armed = false;
        }
        self.state.last_activity_at = now;
    }

    fn select_agent(&mut self, trigger: InterventionTrigger) -> Option<AgentRef> {
        let facilitator = self.roster.facilitator().map(|p| p.agent.clone());
        match trigger {
            InterventionTrigger::WordCount => facilitator,
            InterventionTrigger::Idle => {
                let peers: Vec<&AgentRef> = self.roster.peers().map(|p| &p.agent).collect();
                if peers.is_empty() {
                    facilitator
                } else {
                    Some(peers[self.rng.gen_range(0..peers.len())].clone())
                }
            }
        }
    }
}
