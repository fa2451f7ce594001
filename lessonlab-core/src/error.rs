//! Error types for lessonlab-core

use thiserror::Error;

use crate::stage::Stage;
use crate::types::{AgentRef, TurnId};

/// Result alias for facade operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for lessonlab-core
#[derive(Error, Debug)]
pub enum Error {
    #[error("Stage transition error: {0}")]
    StageTransition(#[from] StageTransitionError),

    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::Error),

    #[error("Dialogue error: {0}")]
    Dialogue(#[from] DialogueError),

    #[error("Operation requires stage {expected}, participant is at {actual}")]
    WrongStage { expected: Stage, actual: Stage },

    #[error("Invalid elapsed time: {0} seconds")]
    InvalidElapsed(f64),
}

/// A participant id could not be used as given.
///
/// Never fatal: assignment falls back to a generated development id.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssignmentError {
    #[error("participant id is empty")]
    Empty,

    #[error("participant id is {len} characters long (max {max})")]
    TooLong { len: usize, max: usize },

    #[error("participant id contains invalid character {0:?}")]
    InvalidCharacter(char),
}

/// A requested stage change was not the next stage in the sequence.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid stage transition from {from} to {to}")]
pub struct StageTransitionError {
    pub from: Stage,
    pub to: Stage,
}

/// The text generation service failed for one turn.
///
/// Recovered locally by substituting the persona's fallback text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("generation request failed: {0}")]
    Request(String),

    #[error("generation returned an empty body")]
    EmptyResponse,

    #[error("generation task ended without a result")]
    Dropped,
}

/// Errors raised by the dialogue scheduler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DialogueError {
    #[error("agent not in session roster: {0}")]
    UnknownAgent(AgentRef),

    #[error("turn {active} is still generating or revealing")]
    TurnInFlight { active: TurnId },

    #[error("human input is paused while an intervention plays")]
    InputPaused,
}
