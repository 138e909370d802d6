//! Client end of the session protocol.
//!
//! Sends the token and configuration, then processes server frames strictly
//! in arrival order until a terminal message arrives or the peer goes away.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use super::artifacts::ArtifactStore;
use super::protocol::{AuthRequest, ControlMessage, Envelope, Frame, SessionConfig};
use super::state::{Session, SessionStatus};
use super::transport::{FrameTransport, WsClientTransport};
use super::SessionError;
use crate::config::ClientConfig;

/// How a client session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEnd {
    /// Server sent `"Processing complete"`
    Completed(Envelope),
    /// Server sent `"Process interruption"`
    Interrupted(Envelope),
    /// Transport closed without a terminal message
    PeerClosed,
}

/// Summary of a finished client session.
#[derive(Debug)]
pub struct ClientReport {
    pub session_id: Uuid,
    pub end: SessionEnd,
    pub acks_sent: usize,
    pub artifacts: Vec<PathBuf>,
    /// Envelopes with unrecognised `message` values
    pub forwarded: Vec<Envelope>,
    pub decode_failures: usize,
    pub history: Vec<SessionStatus>,
}

/// Result of processing one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Finished,
}

pub struct SessionClient<T: FrameTransport> {
    transport: T,
    session: Session,
    artifacts: ArtifactStore,
    pacing: Duration,
    observer: Option<mpsc::UnboundedSender<Envelope>>,
    end: Option<SessionEnd>,
    acks_sent: usize,
    stored: Vec<PathBuf>,
    forwarded: Vec<Envelope>,
    decode_failures: usize,
}

/// Connect to the server in `config` and run one full session.
pub async fn run_from_config(
    config: &ClientConfig,
    observer: Option<mpsc::UnboundedSender<Envelope>>,
) -> Result<ClientReport, SessionError> {
    let session = Session::new();
    let artifact_dir = config.artifact_dir.join(session.id().to_string());

    // A failed handshake discards the session before it reaches Authenticating.
    let transport = WsClientTransport::connect(&config.url).await?;

    let mut client = SessionClient::with_session(
        transport,
        session,
        ArtifactStore::new(artifact_dir),
        config.pacing,
    );
    if let Some(observer) = observer {
        client = client.with_observer(observer);
    }
    client.run(&config.token, &config.session).await
}

impl<T: FrameTransport> SessionClient<T> {
    /// Wrap an already connected transport.
    pub fn new(transport: T, artifacts: ArtifactStore, pacing: Duration) -> Self {
        Self::with_session(transport, Session::new(), artifacts, pacing)
    }

    fn with_session(
        transport: T,
        session: Session,
        artifacts: ArtifactStore,
        pacing: Duration,
    ) -> Self {
        Self {
            transport,
            session,
            artifacts,
            pacing,
            observer: None,
            end: None,
            acks_sent: 0,
            stored: Vec::new(),
            forwarded: Vec::new(),
            decode_failures: 0,
        }
    }

    /// Receive a copy of every decoded envelope.
    pub fn with_observer(mut self, observer: mpsc::UnboundedSender<Envelope>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }

    pub fn session_id(&self) -> Uuid {
        self.session.id()
    }

    pub fn acks_sent(&self) -> usize {
        self.acks_sent
    }

    pub fn artifacts(&self) -> &[PathBuf] {
        &self.stored
    }

    /// Handshake, receive loop, report.
    pub async fn run(
        mut self,
        token: &str,
        config: &SessionConfig,
    ) -> Result<ClientReport, SessionError> {
        self.handshake(token, config).await?;
        while self.next_frame().await? == Step::Continue {}
        Ok(self.into_report())
    }

    /// Send the token and the configuration, entering `Running`.
    pub async fn handshake(
        &mut self,
        token: &str,
        config: &SessionConfig,
    ) -> Result<(), SessionError> {
        self.session.transition(SessionStatus::Authenticating)?;
        if token.trim().is_empty() {
            return Err(self
                .abort(SessionError::Auth("session token is empty".to_string()))
                .await);
        }
        let auth = AuthRequest {
            token: token.to_string(),
        };
        if let Err(e) = self.transport.send(auth.to_frame()).await {
            return Err(self.abort(e.into()).await);
        }
        self.session.token = Some(token.to_string());

        self.session.transition(SessionStatus::Configuring)?;
        if let Err(e) = config.validate() {
            return Err(self.abort(e.into()).await);
        }
        if let Err(e) = self.transport.send(config.to_frame()).await {
            return Err(self.abort(e.into()).await);
        }
        self.session.config = Some(config.clone());

        self.session.transition(SessionStatus::Running)?;
        tracing::info!(session = %self.session.id(), "Session running");
        Ok(())
    }

    /// Wait for and process the next frame.
    pub async fn next_frame(&mut self) -> Result<Step, SessionError> {
        if self.session.status() != SessionStatus::Running {
            return Ok(Step::Finished);
        }

        let wire = match self.transport.recv().await {
            Some(Ok(wire)) => wire,
            Some(Err(e)) => return Err(self.abort(e.into()).await),
            None => {
                tracing::warn!(session = %self.session.id(), "Peer closed without a terminal message");
                self.finish(SessionEnd::PeerClosed).await?;
                return Ok(Step::Finished);
            }
        };

        match Frame::decode(wire) {
            Ok(Frame::Binary(bytes)) => {
                match self.artifacts.persist(&bytes).await {
                    Ok(path) => {
                        tracing::info!(bytes = bytes.len(), path = %path.display(), "Received image");
                        self.stored.push(path);
                    }
                    Err(e) => return Err(self.abort(e.into()).await),
                }
                Ok(Step::Continue)
            }
            Ok(Frame::Text(envelope)) => {
                tracing::debug!(message = %envelope.message, "Received envelope");
                let observer_gone = self
                    .observer
                    .as_ref()
                    .is_some_and(|observer| observer.send(envelope.clone()).is_err());
                if observer_gone {
                    tracing::debug!(session = %self.session.id(), "Envelope observer dropped");
                    self.observer = None;
                }
                match envelope.control() {
                    ControlMessage::Processing => {
                        self.session.pending_ack = true;
                        if let Err(e) = self.transport.send(Envelope::ack().to_frame()).await {
                            return Err(self.abort(e.into()).await);
                        }
                        self.session.pending_ack = false;
                        self.acks_sent += 1;
                    }
                    ControlMessage::Complete => {
                        self.finish(SessionEnd::Completed(envelope)).await?;
                        return Ok(Step::Finished);
                    }
                    ControlMessage::Interruption => {
                        tracing::warn!("Server interrupted the session");
                        self.finish(SessionEnd::Interrupted(envelope)).await?;
                        return Ok(Step::Finished);
                    }
                    ControlMessage::Acknowledged | ControlMessage::Other(_) => {
                        tracing::info!(message = %envelope.message, "Forwarding unrecognised message");
                        self.forwarded.push(envelope);
                    }
                }
                self.pace().await;
                Ok(Step::Continue)
            }
            Err(e) => {
                tracing::warn!("Failed to decode frame: {}", e);
                self.decode_failures += 1;
                self.pace().await;
                Ok(Step::Continue)
            }
        }
    }

    async fn pace(&self) {
        if !self.pacing.is_zero() {
            tokio::time::sleep(self.pacing).await;
        }
    }

    async fn finish(&mut self, end: SessionEnd) -> Result<(), SessionError> {
        self.session.transition(SessionStatus::Closing)?;
        if let Err(e) = self.transport.close().await {
            tracing::debug!("Error while closing transport: {}", e);
        }
        self.session.transition(SessionStatus::Closed)?;
        self.end = Some(end);
        Ok(())
    }

    /// Close after a fatal error and hand the error back.
    async fn abort(&mut self, error: SessionError) -> SessionError {
        tracing::error!(session = %self.session.id(), "Session failed: {}", error);
        if self.session.status().is_open() {
            if let Err(e) = self.session.transition(SessionStatus::Closing) {
                return e;
            }
        }
        if self.session.status() == SessionStatus::Closing {
            if let Err(e) = self.transport.close().await {
                tracing::debug!("Error while closing transport: {}", e);
            }
            if let Err(e) = self.session.transition(SessionStatus::Closed) {
                return e;
            }
        }
        error
    }

    pub fn into_report(self) -> ClientReport {
        ClientReport {
            session_id: self.session.id(),
            end: self.end.unwrap_or(SessionEnd::PeerClosed),
            acks_sent: self.acks_sent,
            artifacts: self.stored,
            forwarded: self.forwarded,
            decode_failures: self.decode_failures,
            history: self.session.history().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::protocol::tests::sample_config;
    use crate::session::transport::{memory_pair, MemoryTransport, WireFrame};
    use SessionStatus::*;

    fn text(json: &str) -> WireFrame {
        WireFrame::Text(json.to_string())
    }

    fn client(transport: MemoryTransport, dir: &std::path::Path) -> SessionClient<MemoryTransport> {
        SessionClient::new(transport, ArtifactStore::new(dir), Duration::ZERO)
    }

    async fn drain(peer: &mut MemoryTransport) -> Vec<WireFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = peer.recv().await {
            frames.push(frame.unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn acknowledges_each_processing_frame_then_closes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (local, mut peer) = memory_pair();
        for _ in 0..3 {
            peer.send(text(r#"{"message":"Process processing"}"#)).await.unwrap();
        }
        peer.send(text(r#"{"message":"Processing complete"}"#)).await.unwrap();

        let report = client(local, temp.path())
            .run("T", &sample_config())
            .await
            .unwrap();

        assert_eq!(report.acks_sent, 3);
        assert!(matches!(report.end, SessionEnd::Completed(_)));
        assert_eq!(
            report.history,
            vec![Connecting, Authenticating, Configuring, Running, Closing, Closed]
        );

        let sent = drain(&mut peer).await;
        assert_eq!(sent.len(), 5);
        assert_eq!(sent[0], text(r#"{"token":"T"}"#));
        let WireFrame::Text(config) = &sent[1] else {
            panic!("config must be text");
        };
        let config: serde_json::Value = serde_json::from_str(config).unwrap();
        assert_eq!(config["planner_model"], "deepseek-v3");
        for ack in &sent[2..] {
            assert_eq!(*ack, text(r#"{"message":"Successfully obtained data"}"#));
        }
    }

    #[tokio::test]
    async fn binary_frame_becomes_one_artifact() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (local, mut peer) = memory_pair();
        let image = vec![0xFF, 0xD8, 0xFF, 0x00, 0x11, 0x22, 0x33];
        peer.send(WireFrame::Binary(image.clone())).await.unwrap();

        let mut client = client(local, temp.path());
        client.handshake("T", &sample_config()).await.unwrap();
        assert_eq!(client.next_frame().await.unwrap(), Step::Continue);

        assert_eq!(client.status(), Running);
        assert_eq!(client.artifacts().len(), 1);
        assert_eq!(std::fs::read(&client.artifacts()[0]).unwrap(), image);
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn dropped_observer_is_released_and_session_continues() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (local, mut peer) = memory_pair();
        peer.send(text(r#"{"message":"Process processing","step":1}"#)).await.unwrap();
        peer.send(text(r#"{"message":"Processing complete"}"#)).await.unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut client = client(local, temp.path()).with_observer(tx);
        client.handshake("T", &sample_config()).await.unwrap();

        assert_eq!(client.next_frame().await.unwrap(), Step::Continue);
        assert!(client.observer.is_none());
        assert_eq!(client.acks_sent(), 1);
        assert_eq!(client.next_frame().await.unwrap(), Step::Finished);
        assert!(matches!(client.into_report().end, SessionEnd::Completed(_)));
    }

    #[tokio::test]
    async fn garbled_text_does_not_end_the_session() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (local, mut peer) = memory_pair();
        peer.send(text("not json")).await.unwrap();
        peer.send(text(r#"{"message":"Processing complete"}"#)).await.unwrap();

        let mut client = client(local, temp.path());
        client.handshake("T", &sample_config()).await.unwrap();

        assert_eq!(client.next_frame().await.unwrap(), Step::Continue);
        assert_eq!(client.status(), Running);
        assert_eq!(client.next_frame().await.unwrap(), Step::Finished);
        assert_eq!(client.status(), Closed);

        let report = client.into_report();
        assert_eq!(report.decode_failures, 1);
        assert!(matches!(report.end, SessionEnd::Completed(_)));
    }

    #[tokio::test]
    async fn unknown_messages_are_forwarded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (local, mut peer) = memory_pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        peer.send(text(r#"{"message":"Planner output","plan":["open browser"]}"#))
            .await
            .unwrap();
        peer.send(text(r#"{"message":"Process interruption","error":"executor crashed"}"#))
            .await
            .unwrap();

        let report = client(local, temp.path())
            .with_observer(tx)
            .run("T", &sample_config())
            .await
            .unwrap();

        assert_eq!(report.forwarded.len(), 1);
        assert_eq!(report.forwarded[0].extra["plan"][0], "open browser");
        match report.end {
            SessionEnd::Interrupted(envelope) => {
                assert_eq!(envelope.extra["error"], "executor crashed")
            }
            other => panic!("unexpected end: {other:?}"),
        }
        assert_eq!(report.acks_sent, 0);
        assert_eq!(rx.recv().await.unwrap().message, "Planner output");
        assert_eq!(rx.recv().await.unwrap().message, "Process interruption");
    }

    #[tokio::test]
    async fn peer_hangup_ends_with_explicit_status() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (local, mut peer) = memory_pair();
        peer.send(text(r#"{"message":"Process processing"}"#)).await.unwrap();
        peer.close().await.unwrap();

        let report = client(local, temp.path())
            .run("T", &sample_config())
            .await
            .unwrap();

        assert_eq!(report.end, SessionEnd::PeerClosed);
        assert_eq!(report.acks_sent, 1);
        assert_eq!(report.history.last(), Some(&Closed));
    }

    #[tokio::test]
    async fn empty_token_fails_before_sending() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (local, mut peer) = memory_pair();

        let err = client(local, temp.path())
            .run("", &sample_config())
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Auth(_)));
        assert!(drain(&mut peer).await.is_empty());
    }

    #[tokio::test]
    async fn incomplete_config_fails_before_running() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (local, mut peer) = memory_pair();
        let mut config = sample_config();
        config.executor.api_key.clear();

        let mut client = client(local, temp.path());
        let err = client.handshake("T", &config).await.unwrap_err();

        assert!(matches!(err, SessionError::Config(_)));
        assert_eq!(client.status(), Closed);
        assert_eq!(drain(&mut peer).await, vec![text(r#"{"token":"T"}"#)]);
    }

    #[tokio::test]
    async fn frames_after_close_are_not_read() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (local, mut peer) = memory_pair();
        peer.send(text(r#"{"message":"Processing complete"}"#)).await.unwrap();
        peer.send(text(r#"{"message":"Process processing"}"#)).await.unwrap();

        let mut client = client(local, temp.path());
        client.handshake("T", &sample_config()).await.unwrap();
        assert_eq!(client.next_frame().await.unwrap(), Step::Finished);
        assert_eq!(client.next_frame().await.unwrap(), Step::Finished);
        assert_eq!(client.acks_sent(), 0);
    }
}
