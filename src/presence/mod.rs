//! Presence store: who is viewing which record, and when they were last seen.

mod memory;
mod pg;

pub use memory::MemoryPresenceStore;
pub use pg::{run_migrations, DbPool, PgPresenceStore};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::CollabError;
use crate::protocol::{ActiveSession, RecordId, UserId};

/// Presence older than this is excluded from active queries even if still flagged active.
pub const FRESHNESS_WINDOW_SECS: i64 = 300;

/// Oldest `last_seen` that still counts as active at `now`.
pub fn freshness_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::seconds(FRESHNESS_WINDOW_SECS)
}

/// Backend for presence. Writes must be atomic per `(record_id, user_id)`.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Insert or refresh presence: `last_seen = now`, `is_active = true`.
    async fn upsert(&self, record_id: &RecordId, user_id: UserId) -> Result<(), CollabError>;

    /// Active, fresh sessions for a record joined with user identity, most recent first.
    async fn query_active(&self, record_id: &RecordId) -> Result<Vec<ActiveSession>, CollabError>;

    /// Mark presence inactive. The row is kept.
    async fn deactivate(&self, record_id: &RecordId, user_id: UserId) -> Result<(), CollabError>;

    /// Hard-delete rows last seen before `cutoff`. Returns the number removed.
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, CollabError>;
}
