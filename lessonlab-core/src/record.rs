//! Persisted record types: conversation turns, session records, surveys.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::types::{AgentRef, ItemId, TurnId};

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeakerKind {
    Human,
    Agent,
    System,
}

/// Render lifecycle of a turn: `Pending -> Revealing -> Settled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderState {
    /// Waiting on the generation service ("typing")
    Pending,
    /// Text is being released progressively
    Revealing,
    /// Final (terminal)
    Settled,
}

/// One utterance in the classroom conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: TurnId,
    pub speaker: SpeakerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentRef>,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub render_state: RenderState,
    /// Characters of `body` currently visible to the presentation layer.
    #[serde(default)]
    pub revealed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<DateTime<Utc>>,
    /// Body is pre-authored fallback text rather than generated text.
    #[serde(default)]
    pub fallback: bool,
}

impl ConversationTurn {
    /// The part of the body the presentation layer may show right now.
    #[must_use]
    pub fn visible_text(&self) -> &str {
        match self.render_state {
            RenderState::Pending => "",
            RenderState::Settled => &self.body,
            RenderState::Revealing => match self.body.char_indices().nth(self.revealed) {
                Some((byte, _)) => &self.body[..byte],
                None => &self.body,
            },
        }
    }

    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.render_state == RenderState::Settled
    }

    /// Whitespace-separated word count of the body.
    #[must_use]
    pub fn word_count(&self) -> u64 {
        self.body.split_whitespace().count() as u64
    }
}

/// Which stage produced a session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordPhase {
    Lesson,
    FinalTest,
}

impl RecordPhase {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lesson => "lesson",
            Self::FinalTest => "final-test",
        }
    }
}

/// Everything recorded about one item a participant worked on.
///
/// Keyed by `item_id` per participant; the store keeps at most one record
/// per key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub item_id: ItemId,
    pub item_text: String,
    pub phase: RecordPhase,
    pub condition: Condition,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub elapsed_seconds: f64,
    pub final_answer: Option<String>,
    #[serde(default)]
    pub work_area: String,
    #[serde(default)]
    pub transcript: Vec<ConversationTurn>,
    pub is_correct: Option<bool>,
    #[serde(default)]
    pub timed_out: bool,
}

impl SessionRecord {
    /// Start an empty record for an item.
    pub fn new(
        item_id: ItemId,
        item_text: impl Into<String>,
        phase: RecordPhase,
        condition: Condition,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            item_id,
            item_text: item_text.into(),
            phase,
            condition,
            started_at,
            ended_at: None,
            elapsed_seconds: 0.0,
            final_answer: None,
            work_area: String::new(),
            transcript: Vec::new(),
            is_correct: None,
            timed_out: false,
        }
    }

    /// Merge a newer copy of the same record into this one.
    ///
    /// Scalar fields take the newer values. The transcript is merged by turn
    /// id: known turns keep their position and take the newer copy, unseen
    /// turns are appended in the newer record's order.
    pub fn merge_from(&mut self, newer: SessionRecord) {
        let SessionRecord {
            item_id,
            item_text,
            phase,
            condition,
            started_at,
            ended_at,
            elapsed_seconds,
            final_answer,
            work_area,
            transcript,
            is_correct,
            timed_out,
        } = newer;

        self.item_id = item_id;
        self.item_text = item_text;
        self.phase = phase;
        self.condition = condition;
        self.started_at = started_at;
        self.ended_at = ended_at;
        self.elapsed_seconds = elapsed_seconds;
        self.final_answer = final_answer;
        self.work_area = work_area;
        self.is_correct = is_correct;
        self.timed_out = timed_out;

        let positions: HashMap<TurnId, usize> = self
            .transcript
            .iter()
            .enumerate()
            .map(|(i, turn)| (turn.id, i))
            .collect();
        for turn in transcript {
            match positions.get(&turn.id) {
                Some(&i) => self.transcript[i] = turn,
                None => self.transcript.push(turn),
            }
        }
    }
}

/// Which survey a payload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurveyKind {
    Pre,
    Post,
}

impl SurveyKind {
    /// Convert to database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pre => "pre",
            Self::Post => "post",
        }
    }

    /// Parse from database string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pre" => Some(Self::Pre),
            "post" => Some(Self::Post),
            _ => None,
        }
    }
}

/// Answers to one survey.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveyResponse {
    pub kind: SurveyKind,
    pub answers: BTreeMap<String, serde_json::Value>,
    pub submitted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(id: u64, body: &str) -> ConversationTurn {
        ConversationTurn {
            id: TurnId(id),
            speaker: SpeakerKind::Human,
            agent: None,
            body: body.to_string(),
            created_at: Utc::now(),
            render_state: RenderState::Settled,
            revealed: body.chars().count(),
            settled_at: Some(Utc::now()),
            fallback: false,
        }
    }

    fn record() -> SessionRecord {
        SessionRecord::new(
            ItemId(5),
            "What is 3/4 of 12?",
            RecordPhase::Lesson,
            Condition::Multi,
            Utc::now(),
        )
    }

    #[test]
    fn visible_text_follows_render_state() {
        let mut t = turn(1, "héllo world");
        t.render_state = RenderState::Pending;
        assert_eq!(t.visible_text(), "");

        t.render_state = RenderState::Revealing;
        t.revealed = 2;
        assert_eq!(t.visible_text(), "hé");

        t.revealed = 100;
        assert_eq!(t.visible_text(), "héllo world");

        t.render_state = RenderState::Settled;
        t.revealed = 0;
        assert_eq!(t.visible_text(), "héllo world");
    }

    #[test]
    fn word_count_splits_on_whitespace() {
        assert_eq!(turn(1, "  one two\tthree\nfour ").word_count(), 4);
        assert_eq!(turn(1, "").word_count(), 0);
    }

    #[test]
    fn merge_overwrites_scalars() {
        let mut existing = record();
        existing.final_answer = Some("8".to_string());

        let mut newer = record();
        newer.final_answer = Some("9".to_string());
        newer.is_correct = Some(true);
        newer.timed_out = true;

        existing.merge_from(newer);
        assert_eq!(existing.final_answer.as_deref(), Some("9"));
        assert_eq!(existing.is_correct, Some(true));
        assert!(existing.timed_out);
    }

    #[test]
    fn merge_appends_unseen_turns_and_replaces_known_ones() {
        let mut existing = record();
        existing.transcript = vec![turn(1, "a"), turn(2, "b")];

        let mut newer = record();
        newer.transcript = vec![turn(2, "b edited"), turn(3, "c")];

        existing.merge_from(newer);
        let bodies: Vec<&str> = existing.transcript.iter().map(|t| t.body.as_str()).collect();
        assert_eq!(bodies, vec!["a", "b edited", "c"]);
    }

    #[test]
    fn merging_the_same_record_twice_is_idempotent() {
        let mut newer = record();
        newer.transcript = vec![turn(1, "a"), turn(2, "b")];

        let mut existing = record();
        existing.merge_from(newer.clone());
        let once = existing.clone();
        existing.merge_from(newer);
        assert_eq!(existing, once);
    }

    #[test]
    fn session_record_serialization_roundtrip() {
        let mut rec = record();
        rec.transcript.push(turn(1, "hello"));
        let json = serde_json::to_string(&rec).unwrap();
        let parsed: SessionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(rec, parsed);
    }

    #[test]
    fn survey_kind_as_str_and_parse_agree() {
        for kind in [SurveyKind::Pre, SurveyKind::Post] {
            assert_eq!(SurveyKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(SurveyKind::parse("mid"), None);
    }
}
