//! Strict decoder for the model's verdict reply.
//!
//! The reply is untrusted text that should hold one JSON object, optionally
//! wrapped in Markdown code fences. Anything that does not decode into
//! `{thinking: string, is_completed: bool}` is an error; there is no
//! fallback verdict.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The structured result of one verification call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub thinking: String,
    pub is_completed: bool,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("reply is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("reply is not a JSON object")]
    NotAnObject,

    #[error("reply is missing required key '{0}'")]
    MissingField(&'static str),

    #[error("key '{field}' must be a {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
}

/// Remove any number of leading/trailing Markdown fence markers
/// (```` ``` ```` or ```` ```json ````).
pub fn strip_fences(text: &str) -> &str {
    let mut s = text.trim();
    loop {
        let before = s.len();
        if let Some(rest) = s.strip_prefix("```") {
            let rest = match rest.get(..4) {
                Some(tag) if tag.eq_ignore_ascii_case("json") => &rest[4..],
                _ => rest,
            };
            s = rest.trim_start();
        }
        if let Some(rest) = s.strip_suffix("```") {
            s = rest.trim_end();
        }
        if s.len() == before {
            return s;
        }
    }
}

/// Parse a model reply into a [`Verdict`].
pub fn parse(text: &str) -> Result<Verdict, ParseError> {
    let value: Value = serde_json::from_str(strip_fences(text))?;
    let object = value.as_object().ok_or(ParseError::NotAnObject)?;

    let thinking = object
        .get("thinking")
        .ok_or(ParseError::MissingField("thinking"))?
        .as_str()
        .ok_or(ParseError::WrongType {
            field: "thinking",
            expected: "string",
        })?;

    let is_completed = object
        .get("is_completed")
        .ok_or(ParseError::MissingField("is_completed"))?
        .as_bool()
        .ok_or(ParseError::WrongType {
            field: "is_completed",
            expected: "boolean",
        })?;

    Ok(Verdict {
        thinking: thinking.to_string(),
        is_completed,
    })
}
