//! Configuration management for the verifier and the session endpoints.
//!
//! Configuration can be set via environment variables:
//! - `VERIFIER_API_KEY` - Required. API key for the vision model endpoint.
//! - `VERIFIER_MODEL` - Required. Model identifier used for verification.
//! - `VERIFIER_BASE_URL` - Optional. OpenAI-compatible base URL. Defaults to `https://api.openai.com/v1`.
//! - `CONTROLLED_OS` - Required. Name of the operating system being automated.
//! - `RUN_FOLDER` - Required. Folder where the executor drops screenshots.
//! - `HOST` - Optional. Session server host. Defaults to `0.0.0.0`.
//! - `PORT` - Optional. Session server port. Defaults to `8000`.
//! - `SESSION_TOKEN` - Required for both session ends.
//! - `SESSION_URL` - Optional. Client target. Defaults to `ws://127.0.0.1:8000/chat`.
//! - `{PLANNER,DISPATCHER,EXECUTOR}_{MODEL,PROVIDER,API_KEY,BASE_URL}` - Client role settings.
//! - `USER_QUERY` - Required for the client.
//! - `ARTIFACT_DIR` - Optional. Where the client stores received images. Defaults to `./artifacts`.
//! - `SESSION_PACING_MS` - Optional. Client pause after each text frame. Defaults to `500`.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::session::{RoleConfig, SessionConfig};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_SESSION_URL: &str = "ws://127.0.0.1:8000/chat";
pub const DEFAULT_PACING_MS: u64 = 500;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

fn required_env(name: &str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingEnvVar(name.to_string())),
    }
}

fn non_empty(field: &str, value: String) -> Result<String, ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(field.to_string()));
    }
    Ok(value)
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

/// Settings for the verification client.
///
/// All fields are validated when the struct is built, so a `VerifierConfig`
/// in hand is always usable.
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// API key for the vision model endpoint
    pub api_key: String,

    /// OpenAI-compatible base URL
    pub base_url: String,

    /// Model identifier
    pub model: String,

    /// Name of the controlled operating system, rendered into the prompt
    pub controlled_os: String,

    /// Folder the executor writes screenshots into
    pub run_folder: PathBuf,
}

impl VerifierConfig {
    /// Build a validated config.
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        controlled_os: impl Into<String>,
        run_folder: impl Into<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let base_url = non_empty("base_url", base_url.into())?;
        url::Url::parse(&base_url)
            .map_err(|e| ConfigError::InvalidValue("base_url".to_string(), e.to_string()))?;

        let run_folder = run_folder.into();
        if run_folder.as_os_str().is_empty() {
            return Err(ConfigError::MissingField("run_folder".to_string()));
        }

        Ok(Self {
            api_key: non_empty("api_key", api_key.into())?,
            base_url,
            model: non_empty("model", model.into())?,
            controlled_os: non_empty("controlled_os", controlled_os.into())?,
            run_folder,
        })
    }

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if a required variable is unset or blank.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url =
            std::env::var("VERIFIER_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());

        Self::new(
            required_env("VERIFIER_API_KEY")?,
            base_url,
            required_env("VERIFIER_MODEL")?,
            required_env("CONTROLLED_OS")?,
            required_env("RUN_FOLDER")?,
        )
    }
}

/// Settings for the session server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Token every session must present first
    pub session_token: String,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: parse_env("PORT", 8000u16)?,
            session_token: required_env("SESSION_TOKEN")?,
        })
    }
}

/// Settings for the session client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the session server
    pub url: String,

    /// Opaque token sent as the first frame
    pub token: String,

    /// Configuration payload sent as the second frame
    pub session: SessionConfig,

    /// Where received image frames are written
    pub artifact_dir: PathBuf,

    /// Pause after each processed text frame
    pub pacing: Duration,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let url = std::env::var("SESSION_URL").unwrap_or_else(|_| DEFAULT_SESSION_URL.to_string());
        let parsed = url::Url::parse(&url)
            .map_err(|e| ConfigError::InvalidValue("SESSION_URL".to_string(), e.to_string()))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(ConfigError::InvalidValue(
                "SESSION_URL".to_string(),
                format!("unsupported scheme '{}'", parsed.scheme()),
            ));
        }

        let session = SessionConfig {
            planner: role_from_env("PLANNER")?,
            dispatcher: role_from_env("DISPATCHER")?,
            executor: role_from_env("EXECUTOR")?,
            user_query: required_env("USER_QUERY")?,
        };

        Ok(Self {
            url,
            token: required_env("SESSION_TOKEN")?,
            session,
            artifact_dir: std::env::var("ARTIFACT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("artifacts")),
            pacing: Duration::from_millis(parse_env("SESSION_PACING_MS", DEFAULT_PACING_MS)?),
        })
    }
}

/// Read one role's settings. `base_url` may be blank (provider default).
fn role_from_env(prefix: &str) -> Result<RoleConfig, ConfigError> {
    let base_url_var = format!("{}_BASE_URL", prefix);
    Ok(RoleConfig {
        model: required_env(&format!("{}_MODEL", prefix))?,
        provider: required_env(&format!("{}_PROVIDER", prefix))?,
        api_key: required_env(&format!("{}_API_KEY", prefix))?,
        base_url: std::env::var(&base_url_var).unwrap_or_default(),
    })
}
