//! Screenshot verifier - judges whether a task is complete.
//!
//! # Flow
//! 1. Render the system and user prompts for the task
//! 2. Attach the screenshot as an inline `data:image/png;base64,...` URI
//! 3. Make exactly one chat-completion call
//! 4. Decode the reply into a [`Verdict`]
//!
//! Every call is independent: no retries, no caching. A verdict must reflect
//! the desktop at call time.

pub mod prompt;
pub mod screenshot;
pub mod verdict;

pub use prompt::PromptBuilder;
pub use screenshot::{LatestScreenshot, ScreenshotProvider};
pub use verdict::{ParseError, Verdict};

use std::sync::Arc;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ConfigError, VerifierConfig};
use crate::llm::{
    ChatMessage, ChatResponse, ContentPart, LlmClient, LlmError, OpenAiCompatibleClient, Role,
    TokenUsage,
};

/// Default lower pixel bound (56 x 56).
pub const DEFAULT_MIN_PIXELS: u64 = 3136;
/// Default upper pixel bound.
pub const DEFAULT_MAX_PIXELS: u64 = 12_845_056;

/// A natural-language goal to verify.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task: String,
}

impl Task {
    pub fn new(task: impl Into<String>) -> Self {
        Self { task: task.into() }
    }
}

/// Pixel bounds the model uses when resizing the screenshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionBounds {
    min_pixels: u64,
    max_pixels: u64,
}

impl ResolutionBounds {
    pub fn new(min_pixels: u64, max_pixels: u64) -> Result<Self, ConfigError> {
        if min_pixels == 0 || min_pixels > max_pixels {
            return Err(ConfigError::InvalidValue(
                "min_pixels/max_pixels".to_string(),
                format!("need 0 < min_pixels <= max_pixels, got {min_pixels}/{max_pixels}"),
            ));
        }
        Ok(Self {
            min_pixels,
            max_pixels,
        })
    }

    pub fn min_pixels(&self) -> u64 {
        self.min_pixels
    }

    pub fn max_pixels(&self) -> u64 {
        self.max_pixels
    }
}

impl Default for ResolutionBounds {
    fn default() -> Self {
        Self {
            min_pixels: DEFAULT_MIN_PIXELS,
            max_pixels: DEFAULT_MAX_PIXELS,
        }
    }
}

/// Everything sent to the model for one call. Built per call, never stored.
#[derive(Debug, Clone)]
pub struct VerificationRequest<'a> {
    pub system_prompt: String,
    pub user_prompt: String,
    pub screenshot: &'a [u8],
}

impl VerificationRequest<'_> {
    /// System turn plus a user turn with one text part and one image part.
    ///
    /// Pixel bounds go on the image part only when given; plain
    /// OpenAI-compatible endpoints reject unknown content-part keys.
    pub fn to_messages(&self, bounds: Option<ResolutionBounds>) -> Vec<ChatMessage> {
        let data_uri = format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(self.screenshot)
        );
        vec![
            ChatMessage::new(Role::System, self.system_prompt.clone()),
            ChatMessage::with_parts(
                Role::User,
                vec![
                    ContentPart::text(self.user_prompt.clone()),
                    match bounds {
                        Some(bounds) => ContentPart::image_url_with_bounds(
                            data_uri,
                            bounds.min_pixels(),
                            bounds.max_pixels(),
                        ),
                        None => ContentPart::image_url(data_uri),
                    },
                ],
            ),
        ]
    }
}

/// Result of one verification call.
#[derive(Debug, Clone)]
pub struct Verification {
    pub verdict: Verdict,
    /// The raw completion, kept for audit
    pub response: ChatResponse,
    pub model: String,
    pub checked_at: DateTime<Utc>,
}

impl Verification {
    pub fn usage(&self) -> Option<&TokenUsage> {
        self.response.usage.as_ref()
    }
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("task description is empty")]
    EmptyTask,

    #[error("no screenshot available: {0}")]
    MissingScreenshot(String),

    #[error("remote verification call failed: {0}")]
    RemoteCall(#[from] LlmError),

    #[error("malformed verdict: {source}")]
    MalformedVerdict {
        #[source]
        source: ParseError,
        /// The reply text that failed to decode
        reply: String,
    },
}

/// Judges task completion from a screenshot using a vision model.
pub struct Verifier {
    llm: Arc<dyn LlmClient>,
    model: String,
    prompts: PromptBuilder,
}

impl Verifier {
    pub fn new(llm: Arc<dyn LlmClient>, model: impl Into<String>, prompts: PromptBuilder) -> Self {
        Self {
            llm,
            model: model.into(),
            prompts,
        }
    }

    /// Build a verifier backed by the OpenAI-compatible HTTP client.
    pub fn from_config(config: &VerifierConfig) -> Self {
        let llm = OpenAiCompatibleClient::new(config.api_key.clone(), &config.base_url);
        Self::new(
            Arc::new(llm),
            config.model.clone(),
            PromptBuilder::new(config.controlled_os.clone()),
        )
    }

    /// Verify `task` against `screenshot`, leaving image sizing to the endpoint.
    ///
    /// # Errors
    /// - `EmptyTask` / `MissingScreenshot` before any remote call
    /// - `RemoteCall` when the endpoint fails
    /// - `MalformedVerdict` when the reply does not decode
    pub async fn verify(&self, task: &Task, screenshot: &[u8]) -> Result<Verification, VerifyError> {
        self.verify_inner(task, screenshot, None).await
    }

    /// Like [`Verifier::verify`], but sends `min_pixels`/`max_pixels` with the
    /// image. Only Qwen-VL style endpoints accept these.
    pub async fn verify_with_bounds(
        &self,
        task: &Task,
        screenshot: &[u8],
        bounds: ResolutionBounds,
    ) -> Result<Verification, VerifyError> {
        self.verify_inner(task, screenshot, Some(bounds)).await
    }

    async fn verify_inner(
        &self,
        task: &Task,
        screenshot: &[u8],
        bounds: Option<ResolutionBounds>,
    ) -> Result<Verification, VerifyError> {
        if task.task.trim().is_empty() {
            return Err(VerifyError::EmptyTask);
        }
        if screenshot.is_empty() {
            return Err(VerifyError::MissingScreenshot(
                "screenshot is empty".to_string(),
            ));
        }

        let request = VerificationRequest {
            system_prompt: self.prompts.system_prompt(),
            user_prompt: self.prompts.user_prompt(&task.task),
            screenshot,
        };
        let messages = request.to_messages(bounds);

        tracing::info!(
            model = %self.model,
            screenshot_bytes = screenshot.len(),
            "Verifying task: {}",
            task.task
        );

        let response = self.llm.chat_completion(&self.model, &messages).await?;
        let reply = response.content.clone().unwrap_or_default();

        let verdict = verdict::parse(&reply).map_err(|source| {
            tracing::warn!("Verifier reply did not decode: {}", source);
            VerifyError::MalformedVerdict {
                source,
                reply: reply.clone(),
            }
        })?;

        tracing::info!(
            is_completed = verdict.is_completed,
            "Verdict: {}",
            verdict.thinking
        );

        Ok(Verification {
            verdict,
            model: response.model.clone().unwrap_or_else(|| self.model.clone()),
            response,
            checked_at: Utc::now(),
        })
    }

    /// Capture the current screenshot from `provider`, then verify.
    pub async fn verify_current(
        &self,
        task: &Task,
        provider: &dyn ScreenshotProvider,
    ) -> Result<Verification, VerifyError> {
        let screenshot = provider
            .capture()
            .await
            .map_err(|e| VerifyError::MissingScreenshot(e.to_string()))?
            .ok_or_else(|| VerifyError::MissingScreenshot("no image captured".to_string()))?;
        self.verify(task, &screenshot).await
    }
}
