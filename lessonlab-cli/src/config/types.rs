use serde::Deserialize;
use std::path::PathBuf;

/// Configuration as stored in TOML files (with optional fields for merging)
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawLessonlabConfig {
    #[serde(default)]
    pub assignment: RawAssignmentConfig,

    #[serde(default)]
    pub dialogue: RawDialogueConfig,

    #[serde(default)]
    pub intervention: RawInterventionConfig,

    #[serde(default)]
    pub storage: RawStorageConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawAssignmentConfig {
    pub item_pool_size: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawDialogueConfig {
    pub reveal_chars_per_second: Option<f64>,
    pub settle_ceiling_seconds: Option<u64>,
    pub prompt_window: Option<usize>,
    pub tick_millis: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawInterventionConfig {
    pub enabled: Option<bool>,
    pub word_threshold: Option<u64>,
    pub idle_threshold_seconds: Option<u64>,
    pub check_interval_seconds: Option<u64>,
}

/// Storage config as stored in TOML (optional fields for proper merging)
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawStorageConfig {
    /// Local write-ahead cache directory
    pub cache_dir: Option<PathBuf>,

    /// Remote primary store URL
    pub primary_url: Option<String>,

    /// Embedded primary database, used when no URL is set
    pub primary_path: Option<PathBuf>,

    /// Embedded secondary database
    pub secondary_path: Option<PathBuf>,

    pub remote_attempts: Option<u32>,
}

/// Env var holding the auth token for a remote primary store
pub const PRIMARY_TOKEN_ENV: &str = "LESSONLAB_PRIMARY_TOKEN";

/// Env var overriding the project config directory
pub const PROJECT_CONFIG_DIR_ENV: &str = "LESSONLAB_PROJECT_CONFIG_DIR";
