//! Simulated classroom agents.

use crate::condition::Condition;
use crate::types::AgentRef;

/// Spoken when a persona has no fallback lines of its own.
pub const GENERIC_FALLBACK: &str = "Hmm, let me think about that for a second.";

/// What part an agent plays in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    /// Guides the discussion and handles word-count interventions.
    Facilitator,
    /// A simulated classmate.
    Peer,
}

/// Everything needed to voice one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentPersona {
    pub agent: AgentRef,
    pub display_name: String,
    pub role: AgentRole,
    pub system_prompt: String,
    /// Instruction appended to the prompt when this agent interjects.
    pub intervention_prompt: String,
    /// Pre-authored lines used when generation fails.
    pub fallback_lines: Vec<String>,
    pub model_hint: Option<String>,
}

impl AgentPersona {
    pub fn new(
        id: &str,
        display_name: &str,
        role: AgentRole,
        system_prompt: &str,
        intervention_prompt: &str,
        fallback_lines: &[&str],
    ) -> Self {
        Self {
            agent: AgentRef::new(id),
            display_name: display_name.to_string(),
            role,
            system_prompt: system_prompt.to_string(),
            intervention_prompt: intervention_prompt.to_string(),
            fallback_lines: fallback_lines.iter().map(|s| s.to_string()).collect(),
            model_hint: None,
        }
    }

    #[must_use]
    pub fn with_model_hint(mut self, hint: impl Into<String>) -> Self {
        self.model_hint = Some(hint.into());
        self
    }

    /// The `n`th fallback line, cycling.
    #[must_use]
    pub fn fallback_line(&self, n: usize) -> &str {
        if self.fallback_lines.is_empty() {
            GENERIC_FALLBACK
        } else {
            &self.fallback_lines[n % self.fallback_lines.len()]
        }
    }
}

fn facilitator() -> AgentPersona {
    AgentPersona::new(
        "facilitator",
        "Ms. Rivera",
        AgentRole::Facilitator,
        "You are Ms. Rivera, a patient math teacher guiding a small group through a fraction word problem. \
         Ask short guiding questions. Never state the final answer outright.",
        "The discussion has gone on for a while. Summarize the ideas so far in two sentences and ask one focused question.",
        &[
            "Let's pause and look at what we know so far. What is the problem really asking?",
            "Good thinking, everyone. Can someone explain their first step?",
        ],
    )
}

fn peer_ada() -> AgentPersona {
    AgentPersona::new(
        "ada",
        "Ada",
        AgentRole::Peer,
        "You are Ada, a confident classmate who likes drawing diagrams. Speak casually in one or two sentences.",
        "It has gone quiet. Share a new idea for the problem or ask the student what they are thinking.",
        &[
            "I'd draw it as a bar split into equal parts.",
            "Wait, what did everyone get for the first step?",
        ],
    )
}

fn peer_ben() -> AgentPersona {
    AgentPersona::new(
        "ben",
        "Ben",
        AgentRole::Peer,
        "You are Ben, a classmate who sometimes makes small mistakes and is happy to be corrected. Speak casually in one or two sentences.",
        "It has gone quiet. Admit what confuses you about the problem and ask for help.",
        &[
            "I'm not sure I get the fraction part. Can someone explain?",
            "I think I multiplied the wrong numbers before.",
        ],
    )
}

fn peer_chloe() -> AgentPersona {
    AgentPersona::new(
        "chloe",
        "Chloe",
        AgentRole::Peer,
        "You are Chloe, a curious classmate who checks answers by working backwards. Speak casually in one or two sentences.",
        "It has gone quiet. Suggest a way to check the current answer.",
        &[
            "We could check it by working backwards.",
            "Does that answer make sense if we plug it back in?",
        ],
    )
}

/// The fixed set of agents available in one lesson session.
///
/// Built once per session and shared read-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRoster {
    condition: Condition,
    agents: Vec<AgentPersona>,
}

impl AgentRoster {
    pub fn new(condition: Condition, agents: Vec<AgentPersona>) -> Self {
        Self { condition, agents }
    }

    /// The standard roster for a condition.
    ///
    /// Every condition has the facilitator; `single` adds one peer, `multi`
    /// and `group` add three.
    pub fn for_condition(condition: Condition) -> Self {
        let mut agents = vec![facilitator()];
        match condition {
            Condition::Solo => {}
            Condition::Single => agents.push(peer_ada()),
            Condition::Multi | Condition::Group => {
                agents.extend([peer_ada(), peer_ben(), peer_chloe()]);
            }
        }
        Self::new(condition, agents)
    }

    #[must_use]
    pub fn condition(&self) -> Condition {
        self.condition
    }

    #[must_use]
    pub fn agents(&self) -> &[AgentPersona] {
        &self.agents
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    #[must_use]
    pub fn get(&self, agent: &AgentRef) -> Option<&AgentPersona> {
        self.agents.iter().find(|p| &p.agent == agent)
    }

    #[must_use]
    pub fn contains(&self, agent: &AgentRef) -> bool {
        self.get(agent).is_some()
    }

    /// The designated facilitator, or the first agent when none is marked.
    #[must_use]
    pub fn facilitator(&self) -> Option<&AgentPersona> {
        self.agents
            .iter()
            .find(|p| p.role == AgentRole::Facilitator)
            .or_else(|| self.agents.first())
    }

    pub fn peers(&self) -> impl Iterator<Item = &AgentPersona> {
        self.agents.iter().filter(|p| p.role == AgentRole::Peer)
    }

    /// Agents that answer a human message, in speaking order.
    ///
    /// `solo` gets no reply, `single` one peer, `multi` every peer, and
    /// `group` every peer followed by the facilitator.
    #[must_use]
    pub fn responders(&self) -> Vec<AgentRef> {
        match self.condition {
            Condition::Solo => Vec::new(),
            Condition::Single => self.peers().take(1).map(|p| p.agent.clone()).collect(),
            Condition::Multi => self.peers().map(|p| p.agent.clone()).collect(),
            Condition::Group => self
                .peers()
                .map(|p| p.agent.clone())
                .chain(self.facilitator().map(|p| p.agent.clone()))
                .collect(),
        }
    }

    /// Display name for an agent, falling back to its id.
    #[must_use]
    pub fn display_name<'a>(&'a self, agent: &'a AgentRef) -> &'a str {
        self.get(agent)
            .map(|p| p.display_name.as_str())
            .unwrap_or(agent.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(refs: &[AgentRef]) -> Vec<&str> {
        refs.iter().map(|r| r.as_str()).collect()
    }

    #[test]
    fn every_condition_has_a_facilitator() {
        for condition in Condition::ALL {
            let roster = AgentRoster::for_condition(condition);
            let facilitator = roster.facilitator().unwrap();
            assert_eq!(facilitator.role, AgentRole::Facilitator);
        }
    }

    #[test]
    fn responders_follow_condition() {
        assert!(AgentRoster::for_condition(Condition::Solo).responders().is_empty());
        assert_eq!(
            ids(&AgentRoster::for_condition(Condition::Single).responders()),
            vec!["ada"]
        );
        assert_eq!(
            ids(&AgentRoster::for_condition(Condition::Multi).responders()),
            vec!["ada", "ben", "chloe"]
        );
        assert_eq!(
            ids(&AgentRoster::for_condition(Condition::Group).responders()),
            vec!["ada", "ben", "chloe", "facilitator"]
        );
    }

    #[test]
    fn fallback_lines_cycle() {
        let persona = peer_ada();
        assert_eq!(persona.fallback_line(0), persona.fallback_line(2));
        assert_ne!(persona.fallback_line(0), persona.fallback_line(1));
    }

    #[test]
    fn persona_without_fallback_uses_generic_line() {
        let persona = AgentPersona::new("x", "X", AgentRole::Peer, "", "", &[]);
        assert_eq!(persona.fallback_line(3), GENERIC_FALLBACK);
    }

    #[test]
    fn facilitator_falls_back_to_first_agent() {
        let roster = AgentRoster::new(Condition::Multi, vec![peer_ben(), peer_ada()]);
        assert_eq!(roster.facilitator().unwrap().agent.as_str(), "ben");
    }

    #[test]
    fn lookup_by_ref() {
        let roster = AgentRoster::for_condition(Condition::Single);
        assert!(roster.contains(&AgentRef::new("ada")));
        assert!(!roster.contains(&AgentRef::new("ben")));
        assert_eq!(roster.display_name(&AgentRef::new("ada")), "Ada");
        assert_eq!(roster.display_name(&AgentRef::new("ghost")), "ghost");
    }
}
