use crate::protocol::{RecordId, UserId, UserSummary};
use crate::schema;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = schema::users)]
pub struct User {
    pub id: i32,
    pub first_name: String,
    pub last_name: String,
    pub avatar_url: Option<String>,
}

impl From<User> for UserSummary {
    fn from(u: User) -> Self {
        UserSummary {
            id: u.id,
            first_name: u.first_name,
            last_name: u.last_name,
            avatar_url: u.avatar_url,
        }
    }
}

/// For inserting presence. `is_active` is always true on insert; see `PgPresenceStore::upsert`.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::presence)]
pub struct NewPresence<'a> {
    pub record_id: &'a str,
    pub user_id: i32,
    pub last_seen: DateTime<Utc>,
    pub is_active: bool,
}

/// Store-agnostic presence record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceRecord {
    pub record_id: RecordId,
    pub user_id: UserId,
    pub last_seen: DateTime<Utc>,
    pub is_active: bool,
}
