//! The fixed, ordered stage sequence and its transition rule.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::assignment::ParticipantContext;
use crate::error::StageTransitionError;

/// Position of a participant in the experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Consent,
    PreSurvey,
    Lesson,
    Break,
    PostSurvey,
    FinalTest,
    /// Terminal
    Completed,
}

impl Stage {
    /// Every stage, in order.
    pub const ORDER: [Stage; 7] = [
        Stage::Consent,
        Stage::PreSurvey,
        Stage::Lesson,
        Stage::Break,
        Stage::PostSurvey,
        Stage::FinalTest,
        Stage::Completed,
    ];

    /// The stage every participant starts in.
    pub const INITIAL: Stage = Stage::Consent;

    /// Position in [`Stage::ORDER`].
    #[must_use]
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// The stage immediately after this one, if any.
    #[must_use]
    pub fn next(&self) -> Option<Stage> {
        Self::ORDER.get(self.index() + 1).copied()
    }

    /// Check if the stage is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        *self == Stage::Completed
    }

    /// Convert to database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Consent => "consent",
            Self::PreSurvey => "pre-survey",
            Self::Lesson => "lesson",
            Self::Break => "break",
            Self::PostSurvey => "post-survey",
            Self::FinalTest => "final-test",
            Self::Completed => "completed",
        }
    }

    /// Parse from database string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ORDER.into_iter().find(|stage| stage.as_str() == s)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Move a participant to `target`.
///
/// Only the stage immediately following the current one is accepted.
/// Anything else is rejected, logged, and leaves `context` untouched.
/// Returning to the initial stage goes through
/// [`reset`](crate::assignment::reset) instead.
pub fn transition(
    context: &ParticipantContext,
    target: Stage,
) -> Result<ParticipantContext, StageTransitionError> {
    let from = context.current_stage;
    if from.next() != Some(target) {
        warn!(
            participant = %context.participant_id,
            from = %from,
            to = %target,
            "rejected stage transition"
        );
        return Err(StageTransitionError { from, to: target });
    }

    info!(
        participant = %context.participant_id,
        from = %from,
        to = %target,
        "stage transition"
    );
    let mut next = context.clone();
    next.current_stage = target;
    Ok(next)
}
