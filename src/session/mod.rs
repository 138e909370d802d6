//! Session protocol - the long-lived channel between orchestrator and peer.
//!
//! # Lifecycle
//! 1. `Connecting`: transport handshake
//! 2. `Authenticating`: `{"token": ...}`
//! 3. `Configuring`: flat per-role configuration plus `user_query`
//! 4. `Running`: image frames and `message` envelopes
//! 5. `Closing` / `Closed`: transport released
//!
//! Both ends live here: [`client::SessionClient`] and [`server::serve_session`].
//! They share the protocol types, the state machine, and the transports.

pub mod artifacts;
pub mod client;
pub mod driver;
pub mod protocol;
pub mod server;
pub mod state;
pub mod transport;

pub use artifacts::ArtifactStore;
pub use client::{ClientReport, SessionClient, SessionEnd};
pub use driver::VerificationDriver;
pub use protocol::{
    AgentRole, AuthRequest, ControlMessage, Envelope, Frame, ProtocolDecodeError, RoleConfig,
    SessionConfig,
};
pub use server::{ServerPeer, ServerReport, SessionDriver};
pub use state::{Session, SessionStatus};
pub use transport::{FrameTransport, TransportError, WireFrame};

use thiserror::Error;

use crate::config::ConfigError;

/// Errors that end a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invalid session configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to store artifact: {0}")]
    Artifact(#[from] std::io::Error),

    #[error("invalid session transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("protocol violation: {0}")]
    Protocol(String),
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::protocol::tests::sample_config;
    use super::server::{router, ServerState};
    use super::*;
    use crate::config::ClientConfig;
    use crate::verifier::tests::MockLlm;
    use crate::verifier::{PromptBuilder, ScreenshotProvider, Verifier};

    struct Fixed(Vec<u8>);

    #[async_trait::async_trait]
    impl ScreenshotProvider for Fixed {
        async fn capture(&self) -> std::io::Result<Option<Vec<u8>>> {
            Ok(Some(self.0.clone()))
        }
    }

    async fn spawn_server(token: &str, driver: Arc<dyn SessionDriver>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(Arc::new(ServerState {
            token: token.to_string(),
            driver,
        }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("ws://{}/chat", addr)
    }

    fn client_config(url: String, token: &str, artifact_dir: &std::path::Path) -> ClientConfig {
        ClientConfig {
            url,
            token: token.to_string(),
            session: sample_config(),
            artifact_dir: artifact_dir.to_path_buf(),
            pacing: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn verdict_travels_over_websocket() {
        let llm = MockLlm::replying(
            "```json\n{\"thinking\": \"The document lists the projects.\", \"is_completed\": true}\n```",
        );
        let verifier = Verifier::new(llm.clone(), "qwen-vl-max", PromptBuilder::new("Windows"));
        let png = b"\x89PNG\r\n\x1a\nscreen".to_vec();
        let driver = Arc::new(VerificationDriver::new(
            Arc::new(verifier),
            Arc::new(Fixed(png.clone())),
        ));
        let url = spawn_server("878141", driver).await;
        let temp = tempfile::tempdir().expect("tempdir");

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let report = client::run_from_config(&client_config(url, "878141", temp.path()), Some(tx))
            .await
            .unwrap();

        assert!(matches!(report.end, SessionEnd::Completed(_)));
        assert_eq!(report.acks_sent, 1);
        assert_eq!(report.artifacts.len(), 1);
        assert!(report.artifacts[0].ends_with("image-0001.png"));
        assert_eq!(std::fs::read(&report.artifacts[0]).unwrap(), png);
        assert_eq!(report.history.last(), Some(&SessionStatus::Closed));

        let progress = rx.recv().await.unwrap();
        assert_eq!(progress.control(), ControlMessage::Processing);
        assert_eq!(progress.extra["is_completed"], true);
        assert_eq!(progress.extra["thinking"], "The document lists the projects.");
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn wrong_token_over_websocket_is_interrupted() {
        let llm = MockLlm::replying("{}");
        let verifier = Verifier::new(llm.clone(), "m", PromptBuilder::new("Linux"));
        let driver = Arc::new(VerificationDriver::new(
            Arc::new(verifier),
            Arc::new(Fixed(vec![1])),
        ));
        let url = spawn_server("878141", driver).await;
        let temp = tempfile::tempdir().expect("tempdir");

        let report = client::run_from_config(&client_config(url, "000000", temp.path()), None)
            .await
            .unwrap();

        match report.end {
            SessionEnd::Interrupted(envelope) => {
                assert!(envelope.extra["error"]
                    .as_str()
                    .unwrap()
                    .contains("authentication failed"));
            }
            other => panic!("unexpected end: {other:?}"),
        }
        assert_eq!(llm.call_count(), 0);
        assert!(report.artifacts.is_empty());
    }

    #[tokio::test]
    async fn unreachable_server_is_a_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let temp = tempfile::tempdir().expect("tempdir");

        let err = client::run_from_config(
            &client_config(format!("ws://{}/chat", addr), "878141", temp.path()),
            None,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SessionError::Transport(TransportError::Connect { .. })));
    }
}
