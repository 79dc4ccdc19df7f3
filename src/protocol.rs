//! Wire protocol: JSON text frames tagged by `type`, camelCase fields.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = i32;

/// Record id placeholder for an unpersisted draft.
pub const DRAFT_RECORD_ID: &str = "new";

/// Identifier of the business record being co-edited.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// True for the `"new"` sentinel. Presence is never touched for drafts.
    pub fn is_draft(&self) -> bool {
        self.0 == DRAFT_RECORD_ID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Messages sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Join {
        record_id: RecordId,
        user_id: UserId,
    },
    Update {
        record_id: RecordId,
        field_name: String,
        field_value: serde_json::Value,
        user_id: UserId,
    },
    Leave {
        record_id: RecordId,
        user_id: UserId,
    },
    Ping,
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Join { .. } => "join",
            ClientMessage::Update { .. } => "update",
            ClientMessage::Leave { .. } => "leave",
            ClientMessage::Ping => "ping",
        }
    }
}

/// Display identity shown next to a presence indicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: UserId,
    pub first_name: String,
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSession {
    pub user: UserSummary,
    pub last_seen: DateTime<Utc>,
}

/// Messages pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Presence {
        record_id: RecordId,
        sessions: Vec<ActiveSession>,
    },
    FieldUpdate {
        record_id: RecordId,
        field_name: String,
        field_value: serde_json::Value,
        updated_by: UserId,
    },
    Pong,
}

impl ServerMessage {
    /// Record the message is about, if any. Clients filter on this.
    pub fn record_id(&self) -> Option<&RecordId> {
        match self {
            ServerMessage::Presence { record_id, .. } => Some(record_id),
            ServerMessage::FieldUpdate { record_id, .. } => Some(record_id),
            ServerMessage::Pong => None,
        }
    }
}
