//! OpenAI-compatible chat-completion client.
//!
//! Works against any endpoint that speaks the `/chat/completions` dialect
//! (OpenAI, DashScope compatible mode, vLLM, OpenRouter, ...). One call is one
//! HTTP request: no retry loop.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::LlmError;
use super::{ChatMessage, ChatResponse, LlmClient, TokenUsage};

/// HTTP client for OpenAI-compatible chat completions.
pub struct OpenAiCompatibleClient {
    client: Client,
    api_key: String,
    endpoint: String,
}

impl OpenAiCompatibleClient {
    /// Create a client for `base_url` (e.g. `https://api.openai.com/v1`).
    pub fn new(api_key: impl Into<String>, base_url: &str) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
        }
    }

    /// The full URL requests are posted to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Parse Retry-After header if present.
    fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok().map(Duration::from_secs))
    }

    fn into_chat_response(body: &str, model: &str) -> Result<ChatResponse, LlmError> {
        let raw: serde_json::Value = serde_json::from_str(body).map_err(|e| {
            LlmError::malformed_reply(format!("Failed to parse response: {}, body: {}", e, body))
        })?;
        let parsed: CompletionResponse = serde_json::from_value(raw.clone()).map_err(|e| {
            LlmError::malformed_reply(format!("Unexpected response shape: {}, body: {}", e, body))
        })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::malformed_reply("No choices in response".to_string()))?;

        Ok(ChatResponse {
            content: choice.message.content,
            finish_reason: choice.finish_reason,
            usage: parsed
                .usage
                .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens)),
            model: parsed.model.or_else(|| Some(model.to_string())),
            raw,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatibleClient {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<ChatResponse, LlmError> {
        let request = CompletionRequest { model, messages };

        tracing::debug!(endpoint = %self.endpoint, model, "Sending chat completion request");

        let response = match self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                if e.is_timeout() {
                    return Err(LlmError::network(format!("Request timeout: {}", e)));
                } else if e.is_connect() {
                    return Err(LlmError::network(format!("Connection failed: {}", e)));
                } else {
                    return Err(LlmError::network(format!("Request failed: {}", e)));
                }
            }
        };

        let status = response.status();
        let retry_after = Self::parse_retry_after(response.headers());
        let body = response
            .text()
            .await
            .map_err(|e| LlmError::network(format!("Failed to read body: {}", e)))?;

        if !status.is_success() {
            let error = LlmError::from_status(status.as_u16(), &body, retry_after);
            tracing::error!("Chat completion failed: {}", error);
            return Err(error);
        }

        Self::into_chat_response(&body, model)
    }
}

/// Chat completion request format.
#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
}

/// Chat completion response format.
#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}
