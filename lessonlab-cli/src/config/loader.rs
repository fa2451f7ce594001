use super::types::{
    PRIMARY_TOKEN_ENV, PROJECT_CONFIG_DIR_ENV, RawAssignmentConfig, RawDialogueConfig,
    RawInterventionConfig, RawLessonlabConfig, RawStorageConfig,
};
use anyhow::{Context, Result};
use directories::ProjectDirs;
use lessonlab_core::{
    AssignmentConfig, DialogueConfig, ExperimentConfig, InterventionConfig, StorageConfig,
};
use std::path::{Path, PathBuf};

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load merged configuration (user + project)
    pub fn load() -> Result<ExperimentConfig> {
        Self::load_layers(
            Self::user_config_path().as_deref(),
            &Self::project_config_path(),
        )
    }

    /// Load and merge the given layers; later layers win
    pub fn load_layers(user: Option<&Path>, project: &Path) -> Result<ExperimentConfig> {
        let mut raw = RawLessonlabConfig::default();

        // Layer 1: User config
        if let Some(user_path) = user
            && user_path.exists()
        {
            raw = Self::merge_raw(raw, Self::read_raw(user_path)?);
        }

        // Layer 2: Project config
        if project.exists() {
            raw = Self::merge_raw(raw, Self::read_raw(project)?);
        }

        // Convert to final config with defaults applied
        Ok(Self::finalize(raw))
    }

    /// Get user config path (platform-specific)
    pub fn user_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "lessonlab").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get project config path
    /// Can be overridden with LESSONLAB_PROJECT_CONFIG_DIR (useful for isolated tests)
    pub fn project_config_path() -> PathBuf {
        if let Ok(dir) = std::env::var(PROJECT_CONFIG_DIR_ENV) {
            PathBuf::from(dir).join("config.toml")
        } else {
            PathBuf::from(".lessonlab/config.toml")
        }
    }

    /// Auth token for a remote primary store, if set
    pub fn primary_token() -> Option<String> {
        std::env::var(PRIMARY_TOKEN_ENV)
            .ok()
            .filter(|token| !token.is_empty())
    }

    fn read_raw(path: &Path) -> Result<RawLessonlabConfig> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("invalid config in {}", path.display()))
    }

    /// Merge two raw configs (overlay values override base only if explicitly set)
    fn merge_raw(base: RawLessonlabConfig, overlay: RawLessonlabConfig) -> RawLessonlabConfig {
        RawLessonlabConfig {
            assignment: RawAssignmentConfig {
                item_pool_size: overlay
                    .assignment
                    .item_pool_size
                    .or(base.assignment.item_pool_size),
            },
            dialogue: RawDialogueConfig {
                reveal_chars_per_second: overlay
                    .dialogue
                    .reveal_chars_per_second
                    .or(base.dialogue.reveal_chars_per_second),
                settle_ceiling_seconds: overlay
                    .dialogue
                    .settle_ceiling_seconds
                    .or(base.dialogue.settle_ceiling_seconds),
                prompt_window: overlay.dialogue.prompt_window.or(base.dialogue.prompt_window),
                tick_millis: overlay.dialogue.tick_millis.or(base.dialogue.tick_millis),
            },
            intervention: RawInterventionConfig {
                enabled: overlay.intervention.enabled.or(base.intervention.enabled),
                word_threshold: overlay
                    .intervention
                    .word_threshold
                    .or(base.intervention.word_threshold),
                idle_threshold_seconds: overlay
                    .intervention
                    .idle_threshold_seconds
                    .or(base.intervention.idle_threshold_seconds),
                check_interval_seconds: overlay
                    .intervention
                    .check_interval_seconds
                    .or(base.intervention.check_interval_seconds),
            },
            storage: RawStorageConfig {
                cache_dir: overlay.storage.cache_dir.or(base.storage.cache_dir),
                primary_url: overlay.storage.primary_url.or(base.storage.primary_url),
                primary_path: overlay.storage.primary_path.or(base.storage.primary_path),
                secondary_path: overlay.storage.secondary_path.or(base.storage.secondary_path),
                remote_attempts: overlay
                    .storage
                    .remote_attempts
                    .or(base.storage.remote_attempts),
            },
        }
    }

    /// Convert raw config to final config with defaults applied
    fn finalize(raw: RawLessonlabConfig) -> ExperimentConfig {
        let assignment = AssignmentConfig::default();
        let dialogue = DialogueConfig::default();
        let intervention = InterventionConfig::default();
        let storage = StorageConfig::default();

        ExperimentConfig {
            assignment: AssignmentConfig {
                item_pool_size: raw
                    .assignment
                    .item_pool_size
                    .unwrap_or(assignment.item_pool_size),
            },
            dialogue: DialogueConfig {
                reveal_chars_per_second: raw
                    .dialogue
                    .reveal_chars_per_second
                    .unwrap_or(dialogue.reveal_chars_per_second),
                settle_ceiling_seconds: raw
                    .dialogue
                    .settle_ceiling_seconds
                    .unwrap_or(dialogue.settle_ceiling_seconds),
                prompt_window: raw.dialogue.prompt_window.unwrap_or(dialogue.prompt_window),
                tick_millis: raw.dialogue.tick_millis.unwrap_or(dialogue.tick_millis),
            },
            intervention: InterventionConfig {
                enabled: raw.intervention.enabled.unwrap_or(intervention.enabled),
                word_threshold: raw
                    .intervention
                    .word_threshold
                    .unwrap_or(intervention.word_threshold),
                idle_threshold_seconds: raw
                    .intervention
                    .idle_threshold_seconds
                    .unwrap_or(intervention.idle_threshold_seconds),
                check_interval_seconds: raw
                    .intervention
                    .check_interval_seconds
                    .unwrap_or(intervention.check_interval_seconds),
            },
            storage: StorageConfig {
                cache_dir: raw.storage.cache_dir.unwrap_or(storage.cache_dir),
                primary_url: raw.storage.primary_url.or(storage.primary_url),
                primary_path: raw.storage.primary_path.unwrap_or(storage.primary_path),
                secondary_path: raw.storage.secondary_path.or(storage.secondary_path),
                remote_attempts: raw
                    .storage
                    .remote_attempts
                    .unwrap_or(storage.remote_attempts),
            },
        }
    }
}
