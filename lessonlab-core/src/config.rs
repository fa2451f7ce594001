//! Experiment configuration.
//!
//! Every section uses `#[serde(default)]`, so a TOML file only needs the
//! keys it wants to change.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Complete configuration for one experiment deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub assignment: AssignmentConfig,
    pub dialogue: DialogueConfig,
    pub intervention: InterventionConfig,
    pub storage: StorageConfig,
}

/// Item pool used by assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssignmentConfig {
    /// Number of items in the question pool.
    pub item_pool_size: u32,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self { item_pool_size: 8 }
    }
}

/// Turn scheduling and reveal parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogueConfig {
    /// Characters released to the presentation layer per second.
    pub reveal_chars_per_second: f64,
    /// Longest a turn may stay pending or revealing before it is force-settled.
    pub settle_ceiling_seconds: u64,
    /// Number of recent settled turns included in a prompt.
    pub prompt_window: usize,
    /// Tick granularity used when driving a session.
    pub tick_millis: u64,
}

impl DialogueConfig {
    #[must_use]
    pub fn settle_ceiling(&self) -> Duration {
        Duration::from_secs(self.settle_ceiling_seconds)
    }

    #[must_use]
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis.max(1))
    }
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            reveal_chars_per_second: 40.0,
            settle_ceiling_seconds: 30,
            prompt_window: 8,
            tick_millis: 100,
        }
    }
}

/// Intervention thresholds, shared by every condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterventionConfig {
    /// Whether interventions are enabled.
    pub enabled: bool,
    /// Words across settled turns that trigger a facilitator interjection.
    pub word_threshold: u64,
    /// Seconds without a new turn that trigger a peer interjection.
    pub idle_threshold_seconds: u64,
    /// How often thresholds are checked.
    pub check_interval_seconds: u64,
}

impl InterventionConfig {
    #[must_use]
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_seconds)
    }

    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }
}

impl Default for InterventionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            word_threshold: 150,
            idle_threshold_seconds: 60,
            check_interval_seconds: 5,
        }
    }
}

/// Where records are persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory of the local write-ahead cache.
    pub cache_dir: PathBuf,
    /// Remote Turso URL of the primary store; an embedded file is used when unset.
    pub primary_url: Option<String>,
    /// Embedded database file used as primary when no URL is configured.
    pub primary_path: PathBuf,
    /// Optional embedded database file used as the secondary store.
    pub secondary_path: Option<PathBuf>,
    /// Attempts per remote tier before falling through to the next tier.
    pub remote_attempts: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(".lessonlab/cache"),
            primary_url: None,
            primary_path: PathBuf::from(".lessonlab/primary.db"),
            secondary_path: Some(PathBuf::from(".lessonlab/secondary.db")),
            remote_attempts: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = ExperimentConfig::default();
        assert_eq!(config.assignment.item_pool_size, 8);
        assert_eq!(config.dialogue.settle_ceiling(), Duration::from_secs(30));
        assert_eq!(config.intervention.check_interval(), Duration::from_secs(5));
        assert!(config.intervention.enabled);
        assert_eq!(config.storage.remote_attempts, 2);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let toml_str = r#"
[intervention]
word_threshold = 40

[storage]
remote_attempts = 5
"#;
        let config: ExperimentConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.intervention.word_threshold, 40);
        assert_eq!(config.intervention.idle_threshold_seconds, 60);
        assert_eq!(config.storage.remote_attempts, 5);
        assert_eq!(config.dialogue, DialogueConfig::default());
    }

    #[test]
    fn toml_round_trip() {
        let mut config = ExperimentConfig::default();
        config.dialogue.reveal_chars_per_second = 12.5;
        config.storage.primary_url = Some("libsql://example.turso.io".to_string());

        let toml_str = toml::to_string(&config).unwrap();
        let parsed: ExperimentConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn tick_is_never_zero() {
        let config = DialogueConfig {
            tick_millis: 0,
            ..Default::default()
        };
        assert_eq!(config.tick(), Duration::from_millis(1));
    }
}
