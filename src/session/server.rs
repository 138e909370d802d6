//! Server end of the session protocol.
//!
//! Accepts a WebSocket at `/chat`, checks the token, decodes the
//! configuration, and hands the running session to a [`SessionDriver`].
//! Every session ends with an explicit terminal envelope: `Processing
//! complete` when the driver succeeds, `Process interruption` (with an
//! `error` field) on any fatal failure.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::protocol::{AuthRequest, ControlMessage, Envelope, Frame, SessionConfig};
use super::state::{Session, SessionStatus};
use super::transport::{AxumTransport, FrameTransport, TransportError, WireFrame};
use super::SessionError;
use crate::config::{ConfigError, ServerConfig};

/// Runs the work of one session once it reaches `Running`.
#[async_trait]
pub trait SessionDriver: Send + Sync {
    async fn drive(&self, config: &SessionConfig, peer: &mut ServerPeer<'_>) -> anyhow::Result<()>;
}

/// Handle a driver uses to talk to the connected client.
pub struct ServerPeer<'a> {
    transport: &'a mut dyn FrameTransport,
    session: &'a mut Session,
    images_sent: usize,
    acks_received: usize,
}

impl ServerPeer<'_> {
    pub fn session_id(&self) -> Uuid {
        self.session.id()
    }

    /// Send an image artifact as one binary frame.
    pub async fn send_image(&mut self, bytes: Vec<u8>) -> Result<(), SessionError> {
        let len = bytes.len();
        self.transport.send(WireFrame::Binary(bytes)).await?;
        self.images_sent += 1;
        tracing::debug!(session = %self.session.id(), bytes = len, "Sent image frame");
        Ok(())
    }

    /// Send a `"Process processing"` envelope carrying `payload` and wait for
    /// the client's acknowledgment.
    pub async fn send_progress(
        &mut self,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), SessionError> {
        let mut envelope = Envelope::new(ControlMessage::Processing);
        envelope.extra = payload;
        self.transport.send(envelope.to_frame()).await?;
        self.session.pending_ack = true;

        loop {
            let wire = match self.transport.recv().await {
                Some(Ok(wire)) => wire,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(TransportError::Closed.into()),
            };
            match Frame::decode(wire) {
                Ok(Frame::Text(reply)) if reply.control() == ControlMessage::Acknowledged => {
                    self.session.pending_ack = false;
                    self.acks_received += 1;
                    return Ok(());
                }
                Ok(Frame::Text(other)) => {
                    tracing::info!(message = %other.message, "Ignoring client message while awaiting ack");
                }
                Ok(Frame::Binary(bytes)) => {
                    tracing::warn!(bytes = bytes.len(), "Ignoring binary frame from client");
                }
                Err(e) => {
                    tracing::warn!("Failed to decode client frame: {}", e);
                }
            }
        }
    }

    /// Send a non-terminal informational envelope. No acknowledgment expected.
    pub async fn send_notice(&mut self, envelope: Envelope) -> Result<(), SessionError> {
        let control = envelope.control();
        if control.is_terminal() || control == ControlMessage::Processing {
            return Err(SessionError::Protocol(format!(
                "'{}' is reserved for the session handler",
                envelope.message
            )));
        }
        self.transport.send(envelope.to_frame()).await?;
        Ok(())
    }
}

/// Summary of a server session that reached `Running`.
#[derive(Debug)]
pub struct ServerReport {
    pub session_id: Uuid,
    /// `Complete` or `Interruption`
    pub end: ControlMessage,
    pub images_sent: usize,
    pub acks_received: usize,
    pub history: Vec<SessionStatus>,
}

/// Run one session over `transport` from `Authenticating` to `Closed`.
///
/// # Errors
/// - `Auth` on a missing or wrong token
/// - `Config` on an incomplete configuration
/// - `Transport` if the client disappears before `Running`
///
/// A driver failure is not an error here: it ends the session with
/// `Process interruption` and is reported in [`ServerReport::end`].
pub async fn serve_session<T: FrameTransport>(
    mut transport: T,
    expected_token: &str,
    driver: &dyn SessionDriver,
) -> Result<ServerReport, SessionError> {
    let mut session = Session::new();
    session.transition(SessionStatus::Authenticating)?;

    let token = match read_token(&mut transport).await {
        Ok(token) => token,
        Err(e) => return Err(terminate(&mut transport, &mut session, e).await),
    };
    if !constant_time_eq(&token, expected_token) {
        let error = SessionError::Auth("invalid token".to_string());
        return Err(terminate(&mut transport, &mut session, error).await);
    }
    session.token = Some(token);

    session.transition(SessionStatus::Configuring)?;
    let config = match read_config(&mut transport).await {
        Ok(config) => config,
        Err(e) => return Err(terminate(&mut transport, &mut session, e).await),
    };
    session.config = Some(config.clone());

    session.transition(SessionStatus::Running)?;
    tracing::info!(session = %session.id(), query = %config.user_query, "Session running");

    let (outcome, images_sent, acks_received) = {
        let mut peer = ServerPeer {
            transport: &mut transport,
            session: &mut session,
            images_sent: 0,
            acks_received: 0,
        };
        let outcome = driver.drive(&config, &mut peer).await;
        (outcome, peer.images_sent, peer.acks_received)
    };

    let end = match outcome {
        Ok(()) => Envelope::new(ControlMessage::Complete),
        Err(e) => {
            tracing::error!(session = %session.id(), "Session driver failed: {:#}", e);
            Envelope::new(ControlMessage::Interruption).with_field("error", format!("{:#}", e))
        }
    };
    if let Err(e) = transport.send(end.to_frame()).await {
        tracing::warn!("Could not send terminal message: {}", e);
    }

    session.transition(SessionStatus::Closing)?;
    if let Err(e) = transport.close().await {
        tracing::debug!("Error while closing transport: {}", e);
    }
    session.transition(SessionStatus::Closed)?;

    Ok(ServerReport {
        session_id: session.id(),
        end: end.control(),
        images_sent,
        acks_received,
        history: session.history().to_vec(),
    })
}

async fn read_text<T: FrameTransport>(
    transport: &mut T,
    what: &str,
) -> Result<String, SessionError> {
    match transport.recv().await {
        Some(Ok(WireFrame::Text(text))) => Ok(text),
        Some(Ok(WireFrame::Binary(_))) => Err(SessionError::Protocol(format!(
            "expected {what} as a text frame, got binary"
        ))),
        Some(Err(e)) => Err(e.into()),
        None => Err(TransportError::Closed.into()),
    }
}

async fn read_token<T: FrameTransport>(transport: &mut T) -> Result<String, SessionError> {
    let text = read_text(transport, "token").await.map_err(|e| match e {
        SessionError::Protocol(reason) => SessionError::Auth(reason),
        other => other,
    })?;
    let request: AuthRequest = serde_json::from_str(&text)
        .map_err(|e| SessionError::Auth(format!("malformed token frame: {e}")))?;
    Ok(request.token)
}

async fn read_config<T: FrameTransport>(transport: &mut T) -> Result<SessionConfig, SessionError> {
    let text = read_text(transport, "configuration")
        .await
        .map_err(|e| match e {
            SessionError::Protocol(reason) => {
                SessionError::Config(ConfigError::InvalidValue("config".to_string(), reason))
            }
            other => other,
        })?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| ConfigError::InvalidValue("config".to_string(), e.to_string()))?;
    Ok(SessionConfig::from_wire(&value)?)
}

/// Send `Process interruption` with the error, close, and hand the error back.
async fn terminate<T: FrameTransport>(
    transport: &mut T,
    session: &mut Session,
    error: SessionError,
) -> SessionError {
    tracing::warn!(session = %session.id(), "Rejecting session: {}", error);
    let notice = Envelope::new(ControlMessage::Interruption).with_field("error", error.to_string());
    if let Err(e) = transport.send(notice.to_frame()).await {
        tracing::debug!("Could not send interruption: {}", e);
    }
    if let Err(e) = session.transition(SessionStatus::Closing) {
        return e;
    }
    if let Err(e) = transport.close().await {
        tracing::debug!("Error while closing transport: {}", e);
    }
    if let Err(e) = session.transition(SessionStatus::Closed) {
        return e;
    }
    error
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    if a_bytes.len() != b_bytes.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for i in 0..a_bytes.len() {
        diff |= a_bytes[i] ^ b_bytes[i];
    }
    diff == 0
}

/// Shared state for the WebSocket route.
pub struct ServerState {
    pub token: String,
    pub driver: Arc<dyn SessionDriver>,
}

/// Router exposing the session endpoint at `/chat`.
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/chat", get(chat_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn chat_ws(ws: WebSocketUpgrade, State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let transport = AxumTransport::new(socket);
        match serve_session(transport, &state.token, state.driver.as_ref()).await {
            Ok(report) => tracing::info!(
                session = %report.session_id,
                end = report.end.as_str(),
                images = report.images_sent,
                acks = report.acks_received,
                "Session finished"
            ),
            Err(e) => tracing::warn!("Session ended with error: {}", e),
        }
    })
}

/// Bind and serve until Ctrl+C.
pub async fn serve(config: ServerConfig, driver: Arc<dyn SessionDriver>) -> anyhow::Result<()> {
    let state = Arc::new(ServerState {
        token: config.session_token.clone(),
        driver,
    });
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Session server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
            }
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::protocol::tests::sample_config;
    use crate::session::transport::{memory_pair, MemoryTransport};

    /// Sends one image and two progress updates.
    struct Scripted;

    #[async_trait]
    impl SessionDriver for Scripted {
        async fn drive(
            &self,
            config: &SessionConfig,
            peer: &mut ServerPeer<'_>,
        ) -> anyhow::Result<()> {
            peer.send_image(vec![7; 16]).await?;
            for step in 0..2 {
                let mut payload = serde_json::Map::new();
                payload.insert("step".to_string(), step.into());
                payload.insert("query".to_string(), config.user_query.clone().into());
                peer.send_progress(payload).await?;
            }
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl SessionDriver for Failing {
        async fn drive(&self, _: &SessionConfig, _: &mut ServerPeer<'_>) -> anyhow::Result<()> {
            anyhow::bail!("executor unavailable")
        }
    }

    fn text(json: &str) -> WireFrame {
        WireFrame::Text(json.to_string())
    }

    async fn recv_json(peer: &mut MemoryTransport) -> serde_json::Value {
        match peer.recv().await {
            Some(Ok(WireFrame::Text(t))) => serde_json::from_str(&t).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn drives_session_and_completes() {
        let (server_end, mut client_end) = memory_pair();
        client_end.send(text(r#"{"token":"878141"}"#)).await.unwrap();
        client_end.send(sample_config().to_frame()).await.unwrap();
        // Ack both progress frames up front; the server reads them in order.
        client_end.send(Envelope::ack().to_frame()).await.unwrap();
        client_end.send(Envelope::ack().to_frame()).await.unwrap();

        let report = serve_session(server_end, "878141", &Scripted).await.unwrap();

        assert_eq!(report.end, ControlMessage::Complete);
        assert_eq!(report.images_sent, 1);
        assert_eq!(report.acks_received, 2);
        assert_eq!(report.history.last(), Some(&SessionStatus::Closed));

        assert_eq!(
            client_end.recv().await.unwrap().unwrap(),
            WireFrame::Binary(vec![7; 16])
        );
        let first = recv_json(&mut client_end).await;
        assert_eq!(first["message"], "Process processing");
        assert_eq!(first["step"], 0);
        assert_eq!(first["query"], sample_config().user_query);
        assert_eq!(recv_json(&mut client_end).await["step"], 1);
        assert_eq!(recv_json(&mut client_end).await["message"], "Processing complete");
        assert!(client_end.recv().await.is_none());
    }

    #[tokio::test]
    async fn wrong_token_is_rejected_with_explicit_status() {
        let (server_end, mut client_end) = memory_pair();
        client_end.send(text(r#"{"token":"guess"}"#)).await.unwrap();
        client_end.send(sample_config().to_frame()).await.unwrap();

        let err = serve_session(server_end, "878141", &Scripted).await.unwrap_err();

        assert!(matches!(err, SessionError::Auth(_)));
        let notice = recv_json(&mut client_end).await;
        assert_eq!(notice["message"], "Process interruption");
        assert!(notice["error"].as_str().unwrap().contains("invalid token"));
        assert!(client_end.recv().await.is_none());
    }

    #[tokio::test]
    async fn malformed_token_frame_is_an_auth_error() {
        let (server_end, mut client_end) = memory_pair();
        client_end.send(WireFrame::Binary(vec![1])).await.unwrap();

        let err = serve_session(server_end, "878141", &Scripted).await.unwrap_err();
        assert!(matches!(err, SessionError::Auth(_)));

        let (server_end, mut client_end) = memory_pair();
        client_end.send(text(r#"{"tok":"878141"}"#)).await.unwrap();
        let err = serve_session(server_end, "878141", &Scripted).await.unwrap_err();
        assert!(matches!(err, SessionError::Auth(_)));
    }

    #[tokio::test]
    async fn incomplete_config_never_reaches_running() {
        let (server_end, mut client_end) = memory_pair();
        client_end.send(text(r#"{"token":"878141"}"#)).await.unwrap();
        let mut wire = sample_config().to_wire();
        wire.as_object_mut().unwrap().remove("executor_model");
        client_end.send(WireFrame::Text(wire.to_string())).await.unwrap();

        let err = serve_session(server_end, "878141", &Scripted).await.unwrap_err();

        assert!(matches!(err, SessionError::Config(_)));
        let notice = recv_json(&mut client_end).await;
        assert_eq!(notice["message"], "Process interruption");
        assert!(notice["error"].as_str().unwrap().contains("executor_model"));
    }

    #[tokio::test]
    async fn binary_config_frame_is_a_config_error() {
        let (server_end, mut client_end) = memory_pair();
        client_end.send(text(r#"{"token":"878141"}"#)).await.unwrap();
        client_end.send(WireFrame::Binary(vec![0x7b, 0x7d])).await.unwrap();

        let err = serve_session(server_end, "878141", &Scripted).await.unwrap_err();

        assert!(matches!(
            err,
            SessionError::Config(ConfigError::InvalidValue(ref field, _)) if field == "config"
        ));
        let notice = recv_json(&mut client_end).await;
        assert_eq!(notice["message"], "Process interruption");
        assert!(notice["error"].as_str().unwrap().contains("binary"));
    }

    #[tokio::test]
    async fn driver_failure_interrupts_session() {
        let (server_end, mut client_end) = memory_pair();
        client_end.send(text(r#"{"token":"878141"}"#)).await.unwrap();
        client_end.send(sample_config().to_frame()).await.unwrap();

        let report = serve_session(server_end, "878141", &Failing).await.unwrap();

        assert_eq!(report.end, ControlMessage::Interruption);
        let notice = recv_json(&mut client_end).await;
        assert_eq!(notice["message"], "Process interruption");
        assert_eq!(notice["error"], "executor unavailable");
    }

    #[tokio::test]
    async fn notices_cannot_spoof_control_messages() {
        struct Spoofing;

        #[async_trait]
        impl SessionDriver for Spoofing {
            async fn drive(&self, _: &SessionConfig, peer: &mut ServerPeer<'_>) -> anyhow::Result<()> {
                peer.send_notice(Envelope::new(ControlMessage::Other("Planner output".into())))
                    .await?;
                peer.send_notice(Envelope::new(ControlMessage::Complete)).await?;
                Ok(())
            }
        }

        let (server_end, mut client_end) = memory_pair();
        client_end.send(text(r#"{"token":"t"}"#)).await.unwrap();
        client_end.send(sample_config().to_frame()).await.unwrap();

        let report = serve_session(server_end, "t", &Spoofing).await.unwrap();

        assert_eq!(report.end, ControlMessage::Interruption);
        assert_eq!(recv_json(&mut client_end).await["message"], "Planner output");
        assert_eq!(recv_json(&mut client_end).await["message"], "Process interruption");
    }

    #[test]
    fn constant_time_eq_compares_exactly() {
        assert!(constant_time_eq("878141", "878141"));
        assert!(!constant_time_eq("878141", "878142"));
        assert!(!constant_time_eq("878141", "87814"));
    }
}
