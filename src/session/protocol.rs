//! Session wire protocol.
//!
//! Frames are either raw binary (an image artifact) or UTF-8 text carrying a
//! JSON envelope whose `message` field drives the session state machine.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::transport::WireFrame;
use crate::config::ConfigError;

pub const MSG_PROCESSING: &str = "Process processing";
pub const MSG_COMPLETE: &str = "Processing complete";
pub const MSG_INTERRUPTION: &str = "Process interruption";
pub const MSG_ACK: &str = "Successfully obtained data";

/// Recognised values of the envelope `message` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Server has data for the client and waits for an acknowledgment
    Processing,
    /// Server finished; terminal
    Complete,
    /// Server aborted; terminal
    Interruption,
    /// Client acknowledgment of a `Processing` frame
    Acknowledged,
    /// Anything else, forwarded untouched
    Other(String),
}

impl ControlMessage {
    pub fn from_wire(message: &str) -> Self {
        match message {
            MSG_PROCESSING => Self::Processing,
            MSG_COMPLETE => Self::Complete,
            MSG_INTERRUPTION => Self::Interruption,
            MSG_ACK => Self::Acknowledged,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Processing => MSG_PROCESSING,
            Self::Complete => MSG_COMPLETE,
            Self::Interruption => MSG_INTERRUPTION,
            Self::Acknowledged => MSG_ACK,
            Self::Other(message) => message,
        }
    }

    /// `Complete` and `Interruption` end the session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Interruption)
    }
}

/// JSON text frame. Fields other than `message` are carried through as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    pub fn new(message: ControlMessage) -> Self {
        Self {
            message: message.as_str().to_string(),
            extra: Map::new(),
        }
    }

    pub fn ack() -> Self {
        Self::new(ControlMessage::Acknowledged)
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn control(&self) -> ControlMessage {
        ControlMessage::from_wire(&self.message)
    }

    pub fn to_frame(&self) -> WireFrame {
        WireFrame::Text(serde_json::Value::from(self.clone()).to_string())
    }
}

impl From<Envelope> for Value {
    fn from(envelope: Envelope) -> Self {
        let mut object = envelope.extra;
        object.insert("message".to_string(), Value::String(envelope.message));
        Value::Object(object)
    }
}

/// A textual frame that could not be decoded. Never fatal during `Running`.
#[derive(Debug, Error)]
pub enum ProtocolDecodeError {
    #[error("text frame is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("text frame has no string 'message' field")]
    MissingMessage,
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Binary(Vec<u8>),
    Text(Envelope),
}

impl Frame {
    pub fn decode(frame: WireFrame) -> Result<Self, ProtocolDecodeError> {
        match frame {
            WireFrame::Binary(bytes) => Ok(Frame::Binary(bytes)),
            WireFrame::Text(text) => {
                let value: Value = serde_json::from_str(&text)?;
                if !value.get("message").map_or(false, Value::is_string) {
                    return Err(ProtocolDecodeError::MissingMessage);
                }
                Ok(Frame::Text(serde_json::from_value(value)?))
            }
        }
    }
}

/// First client frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub token: String,
}

impl AuthRequest {
    pub fn to_frame(&self) -> WireFrame {
        WireFrame::Text(serde_json::json!({ "token": self.token }).to_string())
    }
}

/// Pipeline roles configured per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    Planner,
    Dispatcher,
    Executor,
}

impl AgentRole {
    pub const ALL: [AgentRole; 3] = [AgentRole::Planner, AgentRole::Dispatcher, AgentRole::Executor];

    /// Key prefix on the wire, e.g. `planner_model`.
    pub fn prefix(&self) -> &'static str {
        match self {
            AgentRole::Planner => "planner",
            AgentRole::Dispatcher => "dispatcher",
            AgentRole::Executor => "executor",
        }
    }
}

/// Model settings for one role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleConfig {
    pub model: String,
    pub provider: String,
    pub api_key: String,
    /// May be blank, meaning the provider's default endpoint
    pub base_url: String,
}

/// Second client frame: per-role settings and the user query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub planner: RoleConfig,
    pub dispatcher: RoleConfig,
    pub executor: RoleConfig,
    pub user_query: String,
}

impl SessionConfig {
    pub fn role(&self, role: AgentRole) -> &RoleConfig {
        match role {
            AgentRole::Planner => &self.planner,
            AgentRole::Dispatcher => &self.dispatcher,
            AgentRole::Executor => &self.executor,
        }
    }

    /// Every field must be present; all but `base_url` must be non-blank.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for role in AgentRole::ALL {
            let settings = self.role(role);
            for (field, value) in [
                ("model", &settings.model),
                ("provider", &settings.provider),
                ("api_key", &settings.api_key),
            ] {
                if value.trim().is_empty() {
                    return Err(ConfigError::MissingField(format!(
                        "{}_{}",
                        role.prefix(),
                        field
                    )));
                }
            }
            if !settings.base_url.trim().is_empty() {
                url::Url::parse(&settings.base_url).map_err(|e| {
                    ConfigError::InvalidValue(format!("{}_base_url", role.prefix()), e.to_string())
                })?;
            }
        }
        if self.user_query.trim().is_empty() {
            return Err(ConfigError::MissingField("user_query".to_string()));
        }
        Ok(())
    }

    /// Flat JSON object as sent on the wire.
    pub fn to_wire(&self) -> Value {
        let mut object = Map::new();
        for role in AgentRole::ALL {
            let settings = self.role(role);
            let prefix = role.prefix();
            object.insert(format!("{prefix}_model"), settings.model.clone().into());
            object.insert(format!("{prefix}_provider"), settings.provider.clone().into());
            object.insert(format!("{prefix}_api_key"), settings.api_key.clone().into());
            object.insert(format!("{prefix}_base_url"), settings.base_url.clone().into());
        }
        object.insert("user_query".to_string(), self.user_query.clone().into());
        Value::Object(object)
    }

    pub fn to_frame(&self) -> WireFrame {
        WireFrame::Text(self.to_wire().to_string())
    }

    /// Decode and validate the flat wire object.
    pub fn from_wire(value: &Value) -> Result<Self, ConfigError> {
        let object = value.as_object().ok_or_else(|| {
            ConfigError::InvalidValue("config".to_string(), "expected a JSON object".to_string())
        })?;

        let field = |key: String| -> Result<String, ConfigError> {
            match object.get(&key) {
                Some(Value::String(s)) => Ok(s.clone()),
                Some(_) => Err(ConfigError::InvalidValue(key, "expected a string".to_string())),
                None => Err(ConfigError::MissingField(key)),
            }
        };
        let role = |role: AgentRole| -> Result<RoleConfig, ConfigError> {
            let prefix = role.prefix();
            Ok(RoleConfig {
                model: field(format!("{prefix}_model"))?,
                provider: field(format!("{prefix}_provider"))?,
                api_key: field(format!("{prefix}_api_key"))?,
                base_url: field(format!("{prefix}_base_url"))?,
            })
        };

        let config = Self {
            planner: role(AgentRole::Planner)?,
            dispatcher: role(AgentRole::Dispatcher)?,
            executor: role(AgentRole::Executor)?,
            user_query: field("user_query".to_string())?,
        };
        config.validate()?;
        Ok(config)
    }
}
