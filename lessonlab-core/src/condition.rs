//! Experimental conditions (lesson variants).

use std::fmt;

use serde::{Deserialize, Serialize};

/// The lesson variant a participant is assigned to.
///
/// The set is closed; assignment reduces a seed modulo [`Condition::ALL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Participant works alone; only the facilitator may interject
    Solo,
    /// One peer agent answers each message
    Single,
    /// Every peer agent answers each message in turn
    Multi,
    /// Peers discuss, then the facilitator wraps up
    Group,
}

impl Condition {
    /// All conditions in assignment order.
    pub const ALL: [Condition; 4] = [
        Condition::Solo,
        Condition::Single,
        Condition::Multi,
        Condition::Group,
    ];

    /// Pick the condition for a seed.
    #[must_use]
    pub fn from_seed(seed: u64) -> Self {
        Self::ALL[(seed % Self::ALL.len() as u64) as usize]
    }

    /// Convert to database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Solo => "solo",
            Self::Single => "single",
            Self::Multi => "multi",
            Self::Group => "group",
        }
    }

    /// Parse from database string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "solo" => Some(Self::Solo),
            "single" => Some(Self::Single),
            "multi" => Some(Self::Multi),
            "group" => Some(Self::Group),
            _ => None,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn as_str_and_parse_agree() {
        for condition in Condition::ALL {
            assert_eq!(Condition::parse(condition.as_str()), Some(condition));
        }
        assert_eq!(Condition::parse("pair"), None);
    }

    #[test]
    fn from_seed_wraps_around() {
        assert_eq!(Condition::from_seed(0), Condition::Solo);
        assert_eq!(Condition::from_seed(3), Condition::Group);
        assert_eq!(Condition::from_seed(4), Condition::Solo);
        assert_eq!(Condition::from_seed(u64::MAX), Condition::Group);
    }

    #[test]
    fn serializes_as_snake_case() {
        assert_eq!(serde_json::to_string(&Condition::Multi).unwrap(), "\"multi\"");
    }
}
