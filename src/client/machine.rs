//! Client connection state machine, independent of sockets and timers.

use std::time::Duration;

use tracing::warn;

use super::backoff::RetryPolicy;
use crate::error::CollabError;
use crate::protocol::{ActiveSession, RecordId, ServerMessage};

/// Close code for an intentional, normal closure. Never triggers a reconnect.
pub const NORMAL_CLOSE: u16 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDecision {
    /// Reconnect after `delay`; `attempt` is the 1-based retry number.
    Retry { delay: Duration, attempt: u32 },
    Stop,
}

#[derive(Debug)]
pub struct ConnectionMachine {
    policy: RetryPolicy,
    /// Messages about any other record are ignored.
    record_id: Option<RecordId>,
    status: ConnectionStatus,
    attempts: u32,
    sessions: Vec<ActiveSession>,
    last_message: Option<ServerMessage>,
}

impl ConnectionMachine {
    pub fn new(policy: RetryPolicy, record_id: Option<RecordId>) -> Self {
        Self {
            policy,
            record_id,
            status: ConnectionStatus::Disconnected,
            attempts: 0,
            sessions: Vec::new(),
            last_message: None,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn sessions(&self) -> &[ActiveSession] {
        &self.sessions
    }

    pub fn last_message(&self) -> Option<&ServerMessage> {
        self.last_message.as_ref()
    }

    pub fn begin_connect(&mut self) {
        self.status = ConnectionStatus::Connecting;
    }

    /// Socket is open: the retry budget starts over.
    pub fn on_open(&mut self) {
        self.status = ConnectionStatus::Connected;
        self.attempts = 0;
    }

    /// Parse an inbound frame. A presence list replaces the previous one wholesale.
    /// Returns `None` for keepalive replies and for messages about other records.
    pub fn on_text(&mut self, text: &str) -> Result<Option<ServerMessage>, CollabError> {
        let msg: ServerMessage = serde_json::from_str(text)?;
        match msg.record_id() {
            None => return Ok(None),
            Some(r) if Some(r) != self.record_id.as_ref() => return Ok(None),
            Some(_) => {}
        }
        if let ServerMessage::Presence { sessions, .. } = &msg {
            self.sessions = sessions.clone();
        }
        self.last_message = Some(msg.clone());
        Ok(Some(msg))
    }

    /// Errors only mark the connection down; the close that follows decides about retries.
    pub fn on_error(&mut self, err: &CollabError) {
        warn!("collab socket error: {}", err);
        self.status = ConnectionStatus::Disconnected;
    }

    /// `code` is `None` when the socket dropped without a close frame.
    pub fn on_close(&mut self, code: Option<u16>, jitter_unit: f64) -> CloseDecision {
        self.status = ConnectionStatus::Disconnected;
        if code == Some(NORMAL_CLOSE) || self.attempts >= self.policy.max_attempts {
            return CloseDecision::Stop;
        }
        let delay = self.policy.delay(self.attempts, jitter_unit);
        self.attempts += 1;
        CloseDecision::Retry {
            delay,
            attempt: self.attempts,
        }
    }

    /// Back to a clean `Disconnected` state.
    pub fn reset(&mut self) {
        self.status = ConnectionStatus::Disconnected;
        self.attempts = 0;
        self.sessions.clear();
        self.last_message = None;
    }
}
