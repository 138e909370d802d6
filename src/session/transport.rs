//! Frame transports for sessions.
//!
//! [`FrameTransport`] is the seam between the protocol logic and the socket.
//! Implementations exist for the tokio-tungstenite client, the axum server
//! socket, and an in-process channel pair.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// One message unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("transport is closed")]
    Closed,

    #[error("websocket error: {0}")]
    WebSocket(String),
}

/// An ordered, bidirectional stream of frames.
#[async_trait]
pub trait FrameTransport: Send {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError>;

    /// Next frame in arrival order. `None` once the peer has closed.
    async fn recv(&mut self) -> Option<Result<WireFrame, TransportError>>;

    /// Close our side. Further sends fail with [`TransportError::Closed`].
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// WebSocket client transport.
pub struct WsClientTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    closed: bool,
}

impl WsClientTransport {
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        tracing::debug!(url, "WebSocket connected");
        Ok(Self {
            stream,
            closed: false,
        })
    }
}

#[async_trait]
impl FrameTransport for WsClientTransport {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let message = match frame {
            WireFrame::Text(text) => Message::Text(text),
            WireFrame::Binary(bytes) => Message::Binary(bytes),
        };
        self.stream
            .send(message)
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<WireFrame, TransportError>> {
        if self.closed {
            return None;
        }
        while let Some(message) = self.stream.next().await {
            match message {
                Ok(Message::Text(text)) => return Some(Ok(WireFrame::Text(text))),
                Ok(Message::Binary(bytes)) => return Some(Ok(WireFrame::Binary(bytes))),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue, // Ping, Pong, raw frames
                Err(e) => return Some(Err(TransportError::WebSocket(e.to_string()))),
            }
        }
        None
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .close(None)
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }
}

/// Server-side transport over an upgraded axum socket.
pub struct AxumTransport {
    socket: axum::extract::ws::WebSocket,
    closed: bool,
}

impl AxumTransport {
    pub fn new(socket: axum::extract::ws::WebSocket) -> Self {
        Self {
            socket,
            closed: false,
        }
    }
}

#[async_trait]
impl FrameTransport for AxumTransport {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        use axum::extract::ws::Message;

        if self.closed {
            return Err(TransportError::Closed);
        }
        let message = match frame {
            WireFrame::Text(text) => Message::Text(text),
            WireFrame::Binary(bytes) => Message::Binary(bytes),
        };
        self.socket
            .send(message)
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<WireFrame, TransportError>> {
        use axum::extract::ws::Message;

        if self.closed {
            return None;
        }
        while let Some(message) = self.socket.recv().await {
            match message {
                Ok(Message::Text(text)) => return Some(Ok(WireFrame::Text(text))),
                Ok(Message::Binary(bytes)) => return Some(Ok(WireFrame::Binary(bytes))),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(TransportError::WebSocket(e.to_string()))),
            }
        }
        None
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        use axum::extract::ws::Message;

        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.socket
            .send(Message::Close(None))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;

        // Wait for the peer's close frame so unread frames do not reset the connection.
        let drain = async {
            while let Some(Ok(message)) = self.socket.recv().await {
                if matches!(message, Message::Close(_)) {
                    break;
                }
            }
        };
        if tokio::time::timeout(CLOSE_TIMEOUT, drain).await.is_err() {
            tracing::debug!("Peer did not finish the close handshake");
        }
        Ok(())
    }
}

/// In-process transport end. Create connected ends with [`memory_pair`].
pub struct MemoryTransport {
    tx: Option<mpsc::UnboundedSender<WireFrame>>,
    rx: mpsc::UnboundedReceiver<WireFrame>,
}

/// Two connected in-process transport ends.
pub fn memory_pair() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        MemoryTransport {
            tx: Some(a_tx),
            rx: a_rx,
        },
        MemoryTransport {
            tx: Some(b_tx),
            rx: b_rx,
        },
    )
}

impl MemoryTransport {
    /// True once this end has been closed.
    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }
}

#[async_trait]
impl FrameTransport for MemoryTransport {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Option<Result<WireFrame, TransportError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}
