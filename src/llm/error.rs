//! Errors from the chat-completion endpoint.
//!
//! A verification is exactly one request. When it fails the error says what
//! went wrong and whether the endpoint itself flagged it as temporary; asking
//! again is left to whoever holds the task.

use std::time::Duration;

#[derive(Debug)]
pub struct LlmError {
    pub kind: LlmErrorKind,
    /// Set when the endpoint answered with a non-success status
    pub status_code: Option<u16>,
    pub message: String,
    /// The endpoint's `Retry-After` hint, kept as reported
    pub retry_after: Option<Duration>,
}

impl LlmError {
    /// Error for a non-success HTTP reply.
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        Self {
            kind: classify_http_status(status),
            status_code: Some(status),
            message: body.trim().to_string(),
            retry_after,
        }
    }

    /// The request never produced a reply.
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: LlmErrorKind::Network,
            status_code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    /// A 2xx reply whose body is not a usable completion.
    pub fn malformed_reply(message: impl Into<String>) -> Self {
        Self {
            kind: LlmErrorKind::MalformedReply,
            status_code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(code) = self.status_code {
            write!(f, " (HTTP {})", code)?;
        }
        write!(f, ": {}", self.message)?;
        if let Some(delay) = self.retry_after {
            write!(f, " (retry after {}s)", delay.as_secs())?;
        }
        Ok(())
    }
}

impl std::error::Error for LlmError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// 429
    RateLimited,
    /// 5xx, or any status the endpoint should not send
    Unavailable,
    /// Other 4xx: bad key, unknown model, rejected payload
    Rejected,
    /// Connect failure, timeout, truncated body
    Network,
    /// Success status but no decodable completion
    MalformedReply,
}

impl LlmErrorKind {
    /// Whether the same request could succeed later unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmErrorKind::RateLimited | LlmErrorKind::Unavailable | LlmErrorKind::Network
        )
    }
}

impl std::fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            LlmErrorKind::RateLimited => "endpoint rate limited the request",
            LlmErrorKind::Unavailable => "endpoint unavailable",
            LlmErrorKind::Rejected => "endpoint rejected the request",
            LlmErrorKind::Network => "request did not reach the endpoint",
            LlmErrorKind::MalformedReply => "endpoint reply is not a chat completion",
        };
        f.write_str(label)
    }
}

fn classify_http_status(status: u16) -> LlmErrorKind {
    match status {
        429 => LlmErrorKind::RateLimited,
        400..=499 => LlmErrorKind::Rejected,
        _ => LlmErrorKind::Unavailable,
    }
}
