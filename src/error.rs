//! Error taxonomy for the collaboration engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollabError {
    /// Inbound frame was not a valid protocol message. Dropped; the connection stays open.
    #[error("malformed message: {0}")]
    MalformedMessage(#[from] serde_json::Error),

    /// Presence store read/write failed. The triggering broadcast is skipped.
    #[error("presence store error: {0}")]
    PresenceStore(String),

    /// Socket error or abnormal close; drives client reconnection.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<diesel::result::Error> for CollabError {
    fn from(e: diesel::result::Error) -> Self {
        CollabError::PresenceStore(e.to_string())
    }
}

impl From<diesel::r2d2::PoolError> for CollabError {
    fn from(e: diesel::r2d2::PoolError) -> Self {
        CollabError::PresenceStore(format!("pool: {e}"))
    }
}

impl From<tokio::task::JoinError> for CollabError {
    fn from(e: tokio::task::JoinError) -> Self {
        CollabError::PresenceStore(format!("blocking task: {e}"))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for CollabError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        CollabError::Transport(e.to_string())
    }
}
