//! Experiment orchestration core for lessonlab.
//!
//! Runs one participant through a fixed sequence of stages, including a
//! lesson in which simulated classmates discuss a problem with them.
//!
//! # Architecture
//!
//! - **Assignment** ([`assign`]) derives condition and items from the
//!   participant id, deterministically
//! - **Stages** ([`Stage`], [`transition`]) only ever move forward one step
//! - **Dialogue** ([`DialogueScheduler`]) keeps agent turns ordered and
//!   non-overlapping, with a safety valve for stuck turns
//! - **Interventions** ([`InterventionEngine`]) let an agent interject on
//!   long or stalled discussions
//! - **Storage** ([`TieredStore`]) writes ahead to a local cache, then to a
//!   primary and a secondary remote tier
//!
//! [`Experiment`] is the facade that ties these together; a
//! [`LessonSession`] is the single owner of one running lesson.

pub mod assignment;
mod condition;
pub mod config;
pub mod dialogue;
mod error;
mod experiment;
pub mod intervention;
mod lesson;
mod record;
mod stage;
pub mod storage;
mod types;

// Assignment
pub use assignment::{ItemAssignment, ParticipantContext, assign, assign_id, reset};

// Stage machine
pub use condition::Condition;
pub use stage::{Stage, transition};

// Configuration
pub use config::{
    AssignmentConfig, DialogueConfig, ExperimentConfig, InterventionConfig, StorageConfig,
};

// Errors
pub use error::{
    AssignmentError, DialogueError, Error, GenerationError, Result, StageTransitionError,
};

// Facade
pub use experiment::{Experiment, FinalTestSubmission};
pub use lesson::{LessonOutcome, LessonSession};

// Dialogue and interventions
pub use dialogue::{
    AgentRoster, CannedGenerator, DialogueScheduler, GenerationService, TurnEvent,
};
pub use intervention::{Intervention, InterventionEngine, InterventionState, InterventionTrigger};

// Records
pub use record::{
    ConversationTurn, RecordPhase, RenderState, SessionRecord, SpeakerKind, SurveyKind,
    SurveyResponse,
};

// Storage
pub use storage::{SaveResult, TieredStore};

// ID types
pub use types::{AgentRef, ItemId, ParticipantId, TurnId};
