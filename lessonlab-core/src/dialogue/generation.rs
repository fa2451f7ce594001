//! Text generation service seam.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GenerationError;

/// Role of one prompt message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    System,
    User,
    Assistant,
}

/// One message sent to the generation service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTurn {
    pub role: PromptRole,
    pub content: String,
}

impl PromptTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::Assistant,
            content: content.into(),
        }
    }
}

/// Per-call options: who is speaking and which model they prefer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationOptions {
    pub persona: String,
    pub model_hint: Option<String>,
}

/// Produces the body of an agent turn.
///
/// Implementations may fail; the scheduler substitutes the persona's
/// fallback text so a failure never stalls the conversation.
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Service name used in logs.
    fn name(&self) -> &str;

    /// Generate the next utterance for `options.persona`.
    async fn generate(
        &self,
        prompt: Vec<PromptTurn>,
        options: GenerationOptions,
    ) -> Result<String, GenerationError>;
}

const DEFAULT_CANNED_LINES: &[&str] = &[
    "I split it into equal groups first, then counted how many groups we need.",
    "Can you explain how you got that? I got something a bit different.",
    "Let's check it by working backwards from the answer.",
    "I think drawing it as a picture makes the fractions easier to compare.",
    "So the key step is finding what one part is worth.",
];

/// Offline generator that cycles through fixed lines.
///
/// Used for dry-run simulations where no remote service is available.
#[derive(Debug)]
pub struct CannedGenerator {
    lines: Vec<String>,
    next: AtomicUsize,
    latency: Duration,
}

impl CannedGenerator {
    pub fn new(lines: Vec<String>) -> Self {
        Self {
            lines,
            next: AtomicUsize::new(0),
            latency: Duration::ZERO,
        }
    }

    /// Simulated time each call takes before answering.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

impl Default for CannedGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_CANNED_LINES.iter().map(|s| s.to_string()).collect())
    }
}

#[async_trait]
impl GenerationService for CannedGenerator {
    fn name(&self) -> &str {
        "canned"
    }

    async fn generate(
        &self,
        _prompt: Vec<PromptTurn>,
        _options: GenerationOptions,
    ) -> Result<String, GenerationError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.lines.is_empty() {
            return Err(GenerationError::EmptyResponse);
        }
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        Ok(self.lines[n % self.lines.len()].clone())
    }
}
