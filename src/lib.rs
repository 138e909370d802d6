//! # desk-verifier
//!
//! Screenshot-based task verification for desktop-automation agents.
//!
//! This library provides:
//! - A verifier that asks a vision model whether a task is complete and
//!   decodes its reply into a strict `{thinking, is_completed}` verdict
//! - Both ends of the WebSocket session protocol that carries verdicts and
//!   screenshots between the orchestrator and its peers
//!
//! ## Architecture
//!
//! ```text
//!   ScreenshotProvider ──▶ Verifier ──▶ vision model (OpenAI-compatible)
//!                              │
//!                              ▼
//!                           Verdict
//!                              │
//!                              ▼
//!   session::server ◀══ WebSocket ══▶ session::client
//! ```
//!
//! ## Modules
//! - `verifier`: prompts, the verification call, the verdict decoder
//! - `llm`: chat-completion client abstraction
//! - `session`: protocol, state machine, transports, client and server
//! - `config`: environment-driven configuration

pub mod config;
pub mod llm;
pub mod session;
pub mod verifier;

pub use config::{ClientConfig, ConfigError, ServerConfig, VerifierConfig};
pub use verifier::{Task, Verdict, Verification, Verifier, VerifyError};
