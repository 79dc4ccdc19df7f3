//! In-process presence store. Used when no database is configured, and in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::{freshness_cutoff, PresenceStore};
use crate::error::CollabError;
use crate::models::PresenceRecord;
use crate::protocol::{ActiveSession, RecordId, UserId, UserSummary};

#[derive(Default)]
pub struct MemoryPresenceStore {
    /// (record, user) -> presence. The entry API holds the shard lock, so upserts are atomic per key.
    records: DashMap<(RecordId, UserId), PresenceRecord>,
    users: DashMap<UserId, UserSummary>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the identity directory used to decorate active sessions. Users missing from it are
    /// shown with a placeholder name.
    pub fn with_users(users: impl IntoIterator<Item = UserSummary>) -> Self {
        let store = Self::new();
        for u in users {
            store.users.insert(u.id, u);
        }
        store
    }

    pub fn upsert_at(&self, record_id: &RecordId, user_id: UserId, now: DateTime<Utc>) {
        self.records
            .entry((record_id.clone(), user_id))
            .and_modify(|r| {
                r.last_seen = now;
                r.is_active = true;
            })
            .or_insert_with(|| PresenceRecord {
                record_id: record_id.clone(),
                user_id,
                last_seen: now,
                is_active: true,
            });
    }

    pub fn query_active_at(&self, record_id: &RecordId, now: DateTime<Utc>) -> Vec<ActiveSession> {
        let cutoff = freshness_cutoff(now);
        let mut sessions: Vec<ActiveSession> = self
            .records
            .iter()
            .filter(|r| &r.record_id == record_id && r.is_active && r.last_seen > cutoff)
            .map(|r| ActiveSession {
                user: self.lookup_user(r.user_id),
                last_seen: r.last_seen,
            })
            .collect();
        sessions.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        sessions
    }

    /// Raw row, active or not. Lets callers observe soft-deleted history.
    pub fn get(&self, record_id: &RecordId, user_id: UserId) -> Option<PresenceRecord> {
        self.records
            .get(&(record_id.clone(), user_id))
            .map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn lookup_user(&self, id: UserId) -> UserSummary {
        match self.users.get(&id) {
            Some(u) => u.clone(),
            None => UserSummary {
                id,
                first_name: "User".to_string(),
                last_name: id.to_string(),
                avatar_url: None,
            },
        }
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn upsert(&self, record_id: &RecordId, user_id: UserId) -> Result<(), CollabError> {
        self.upsert_at(record_id, user_id, Utc::now());
        Ok(())
    }

    async fn query_active(&self, record_id: &RecordId) -> Result<Vec<ActiveSession>, CollabError> {
        Ok(self.query_active_at(record_id, Utc::now()))
    }

    async fn deactivate(&self, record_id: &RecordId, user_id: UserId) -> Result<(), CollabError> {
        if let Some(mut r) = self.records.get_mut(&(record_id.clone(), user_id)) {
            r.is_active = false;
        }
        Ok(())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, CollabError> {
        let before = self.records.len();
        self.records.retain(|_, r| r.last_seen >= cutoff);
        Ok(before.saturating_sub(self.records.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    fn w1() -> RecordId {
        RecordId::from("W1")
    }

    #[tokio::test]
    async fn distinct_joiners_each_appear_once() {
        let store = MemoryPresenceStore::new();
        for uid in 1..=5 {
            store.upsert(&w1(), uid).await.unwrap();
        }
        let active = store.query_active(&w1()).await.unwrap();
        assert_eq!(active.len(), 5);
        let mut ids: Vec<_> = active.iter().map(|s| s.user.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn concurrent_upserts_for_same_key_keep_one_row() {
        let store = Arc::new(MemoryPresenceStore::new());
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.upsert(&RecordId::from("W1"), 9).await.unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(store.len(), 1);
        assert_eq!(store.query_active(&w1()).await.unwrap().len(), 1);
    }

    #[test]
    fn stale_entries_are_excluded_even_when_active() {
        let store = MemoryPresenceStore::new();
        let now = Utc::now();
        store.upsert_at(&w1(), 1, now - Duration::minutes(6));
        store.upsert_at(&w1(), 2, now - Duration::minutes(4));

        let active = store.query_active_at(&w1(), now);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].user.id, 2);
        assert!(store.get(&w1(), 1).unwrap().is_active);
    }

    #[tokio::test]
    async fn leave_excludes_immediately_and_keeps_row() {
        let store = MemoryPresenceStore::new();
        store.upsert(&w1(), 1).await.unwrap();
        store.upsert(&w1(), 2).await.unwrap();
        store.deactivate(&w1(), 1).await.unwrap();

        let active = store.query_active(&w1()).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].user.id, 2);

        let row = store.get(&w1(), 1).unwrap();
        assert!(!row.is_active);

        // rejoin reactivates the same row
        store.upsert(&w1(), 1).await.unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.query_active(&w1()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn sessions_carry_identity_and_are_scoped_to_record() {
        let store = MemoryPresenceStore::with_users([UserSummary {
            id: 1,
            first_name: "Grace".into(),
            last_name: "Hopper".into(),
            avatar_url: Some("https://example.test/g.png".into()),
        }]);
        store.upsert(&w1(), 1).await.unwrap();
        store.upsert(&RecordId::from("W2"), 2).await.unwrap();

        let active = store.query_active(&w1()).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].user.first_name, "Grace");
        assert_eq!(active[0].user.avatar_url.as_deref(), Some("https://example.test/g.png"));
    }

    #[tokio::test]
    async fn long_record_ids_are_tracked() {
        let store = MemoryPresenceStore::new();
        let long = RecordId::from("w".repeat(200).as_str());
        store.upsert(&long, 1).await.unwrap();
        let active = store.query_active(&long).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].user.first_name, "User");
        assert_eq!(active[0].user.last_name, "1");
    }

    #[tokio::test]
    async fn purge_removes_only_old_rows() {
        let store = MemoryPresenceStore::new();
        let now = Utc::now();
        store.upsert_at(&w1(), 1, now - Duration::days(40));
        store.upsert_at(&w1(), 2, now);
        let removed = store.purge_before(now - Duration::days(30)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(&w1(), 1).is_none());
        assert!(store.get(&w1(), 2).is_some());
    }
}
