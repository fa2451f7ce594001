//! Prompt construction for agent turns.

use std::sync::Arc;

use super::generation::PromptTurn;
use super::roster::AgentRoster;
use crate::record::{ConversationTurn, SpeakerKind};
use crate::types::AgentRef;

/// Builds the prompt for one agent turn from the conversation so far.
///
/// Evaluated when the turn starts, not when it is queued, so a chained turn
/// sees the settled text of the turns ahead of it.
pub type PromptBuilder = Box<dyn FnOnce(&[ConversationTurn]) -> Vec<PromptTurn> + Send>;

/// Standard builder: the speaker's system prompt, an optional extra
/// instruction, then the last `window` settled turns.
///
/// The speaker's own turns become assistant messages; everyone else's are
/// user messages prefixed with their name.
pub fn window_prompt(
    roster: Arc<AgentRoster>,
    speaker: AgentRef,
    instruction: Option<String>,
    window: usize,
) -> PromptBuilder {
    Box::new(move |turns: &[ConversationTurn]| {
        let mut prompt = Vec::new();
        if let Some(persona) = roster.get(&speaker) {
            prompt.push(PromptTurn::system(persona.system_prompt.clone()));
        }

        let settled: Vec<&ConversationTurn> = turns.iter().filter(|t| t.is_settled()).collect();
        let start = settled.len().saturating_sub(window);
        for turn in &settled[start..] {
            let message = match (turn.speaker, turn.agent.as_ref()) {
                (SpeakerKind::System, _) => PromptTurn::system(turn.body.clone()),
                (SpeakerKind::Human, _) => PromptTurn::user(format!("Student: {}", turn.body)),
                (SpeakerKind::Agent, Some(agent)) if *agent == speaker => {
                    PromptTurn::assistant(turn.body.clone())
                }
                (SpeakerKind::Agent, agent) => {
                    let name = agent.map_or("Classmate", |a| roster.display_name(a));
                    PromptTurn::user(format!("{}: {}", name, turn.body))
                }
            };
            prompt.push(message);
        }

        if let Some(instruction) = instruction {
            prompt.push(PromptTurn::system(instruction));
        }
        prompt
    })
}
