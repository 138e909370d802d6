//! Session state machine.
//!
//! ```text
//! Connecting -> Authenticating -> Configuring -> Running -> Closing -> Closed
//!      |              |                |                       ^
//!      v              +----------------+-----------------------+
//!    Closed                     (failure)
//! ```

use serde::Serialize;
use uuid::Uuid;

use super::protocol::SessionConfig;
use super::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionStatus {
    Connecting,
    Authenticating,
    Configuring,
    Running,
    Closing,
    Closed,
}

impl SessionStatus {
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Connecting, Authenticating)
                | (Connecting, Closed)
                | (Authenticating, Configuring)
                | (Authenticating, Closing)
                | (Configuring, Running)
                | (Configuring, Closing)
                | (Running, Closing)
                | (Closing, Closed)
        )
    }

    /// Frames may still be sent or accepted.
    pub fn is_open(self) -> bool {
        !matches!(self, SessionStatus::Closing | SessionStatus::Closed)
    }
}

/// One logical session, owned by exactly one handler.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    status: SessionStatus,
    history: Vec<SessionStatus>,
    pub token: Option<String>,
    pub config: Option<SessionConfig>,
    /// The peer is waiting for an acknowledgment
    pub pending_ack: bool,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            status: SessionStatus::Connecting,
            history: vec![SessionStatus::Connecting],
            token: None,
            config: None,
            pending_ack: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Every status the session has been in, oldest first.
    pub fn history(&self) -> &[SessionStatus] {
        &self.history
    }

    pub fn transition(&mut self, next: SessionStatus) -> Result<(), SessionError> {
        if !self.status.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        tracing::debug!(session = %self.id, from = ?self.status, to = ?next, "Session transition");
        self.status = next;
        self.history.push(next);
        Ok(())
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
