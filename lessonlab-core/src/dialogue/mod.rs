//! Classroom dialogue: agent personas, prompts, generation, and turn
//! scheduling.

mod generation;
mod prompt;
mod roster;
mod scheduler;

pub use generation::{CannedGenerator, GenerationOptions, GenerationService, PromptRole, PromptTurn};
pub use prompt::{PromptBuilder, window_prompt};
pub use roster::{AgentPersona, AgentRole, AgentRoster, GENERIC_FALLBACK};
pub use scheduler::{AgentTurnSpec, DialogueScheduler, SettledTurn, TurnEvent, TurnTag};
