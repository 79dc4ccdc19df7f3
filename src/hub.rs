//! Protocol dispatcher: parses inbound frames, mutates presence, fans out notifications.
//!
//! Every inbound frame is an isolated unit of work. Errors are logged at the per-message boundary
//! and never close the connection or touch other connections.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::error::CollabError;
use crate::metrics::Metrics;
use crate::presence::PresenceStore;
use crate::protocol::{ClientMessage, RecordId, ServerMessage, UserId};
use crate::ws_registry::{ConnId, ConnectionEntry, ConnectionRegistry};

const PONG_JSON: &str = r#"{"type":"pong"}"#;

/// What a successfully handled message did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A notification was queued to `recipients` connections.
    Broadcast { recipients: usize },
    /// Draft record: nothing touched, nothing sent.
    SentinelSkip,
    Pong,
}

pub struct Hub {
    registry: ConnectionRegistry,
    store: Arc<dyn PresenceStore>,
    metrics: Arc<Metrics>,
}

impl Hub {
    pub fn new(store: Arc<dyn PresenceStore>, metrics: Arc<Metrics>, send_buffer: usize) -> Self {
        Self {
            registry: ConnectionRegistry::new(send_buffer),
            store,
            metrics,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn PresenceStore> {
        &self.store
    }

    pub fn on_connect(&self) -> (Arc<ConnectionEntry>, mpsc::Receiver<String>) {
        let (entry, rx) = self.registry.register();
        self.metrics.open_connections.inc();
        debug!(conn_id = entry.conn_id, "ws connected");
        (entry, rx)
    }

    /// Presence is left alone: clients send `leave` first, or the freshness window ages them out.
    pub fn on_close(&self, conn_id: ConnId) {
        if self.registry.remove_connection(conn_id) {
            self.metrics.open_connections.dec();
        }
        debug!(conn_id, "ws closed");
    }

    /// Handle one inbound text frame. Failures are logged and swallowed.
    pub async fn on_message(&self, conn_id: ConnId, raw: &str) -> Option<Dispatch> {
        match self.dispatch(conn_id, raw).await {
            Ok(outcome) => Some(outcome),
            Err(CollabError::MalformedMessage(e)) => {
                self.metrics.malformed_messages.inc();
                warn!(conn_id, "dropping malformed message: {}", e);
                None
            }
            Err(e @ CollabError::PresenceStore(_)) => {
                self.metrics.store_failures.inc();
                error!(conn_id, "presence store failed, broadcast skipped: {}", e);
                None
            }
            Err(e) => {
                error!(conn_id, "message handling failed: {}", e);
                None
            }
        }
    }

    pub async fn dispatch(&self, conn_id: ConnId, raw: &str) -> Result<Dispatch, CollabError> {
        let msg: ClientMessage = serde_json::from_str(raw)?;
        self.metrics.messages.with_label_values(&[msg.kind()]).inc();

        match msg {
            ClientMessage::Join { record_id, user_id } => {
                self.handle_join(conn_id, record_id, user_id).await
            }
            ClientMessage::Update {
                record_id,
                field_name,
                field_value,
                user_id,
            } => {
                self.handle_update(conn_id, record_id, field_name, field_value, user_id)
                    .await
            }
            ClientMessage::Leave { record_id, user_id } => {
                self.handle_leave(conn_id, record_id, user_id).await
            }
            ClientMessage::Ping => {
                if !self.registry.send_to(conn_id, PONG_JSON) {
                    debug!(conn_id, "pong not delivered");
                }
                Ok(Dispatch::Pong)
            }
        }
    }

    async fn handle_join(
        &self,
        conn_id: ConnId,
        record_id: RecordId,
        user_id: UserId,
    ) -> Result<Dispatch, CollabError> {
        if record_id.is_draft() {
            return Ok(Dispatch::SentinelSkip);
        }
        self.registry.subscribe(&record_id, conn_id);
        self.store.upsert(&record_id, user_id).await?;
        debug!(conn_id, %record_id, user_id, "joined");
        self.broadcast_presence(&record_id).await
    }

    async fn handle_update(
        &self,
        conn_id: ConnId,
        record_id: RecordId,
        field_name: String,
        field_value: serde_json::Value,
        user_id: UserId,
    ) -> Result<Dispatch, CollabError> {
        if record_id.is_draft() {
            return Ok(Dispatch::SentinelSkip);
        }
        self.store.upsert(&record_id, user_id).await?;
        let out = ServerMessage::FieldUpdate {
            record_id: record_id.clone(),
            field_name,
            field_value,
            updated_by: user_id,
        };
        let recipients = self.send(&record_id, &out, Some(conn_id))?;
        Ok(Dispatch::Broadcast { recipients })
    }

    async fn handle_leave(
        &self,
        conn_id: ConnId,
        record_id: RecordId,
        user_id: UserId,
    ) -> Result<Dispatch, CollabError> {
        if record_id.is_draft() {
            return Ok(Dispatch::SentinelSkip);
        }
        let result = match self.store.deactivate(&record_id, user_id).await {
            Ok(()) => self.broadcast_presence(&record_id).await,
            Err(e) => Err(e),
        };
        // The leaver sees the final list, then stops receiving for this record.
        self.registry.unsubscribe(&record_id, conn_id);
        debug!(conn_id, %record_id, user_id, "left");
        result
    }

    async fn broadcast_presence(&self, record_id: &RecordId) -> Result<Dispatch, CollabError> {
        let sessions = self.store.query_active(record_id).await?;
        let out = ServerMessage::Presence {
            record_id: record_id.clone(),
            sessions,
        };
        let recipients = self.send(record_id, &out, None)?;
        Ok(Dispatch::Broadcast { recipients })
    }

    fn send(
        &self,
        record_id: &RecordId,
        msg: &ServerMessage,
        except: Option<ConnId>,
    ) -> Result<usize, CollabError> {
        let text = serde_json::to_string(msg)
            .map_err(|e| CollabError::Transport(format!("encode outbound: {e}")))?;
        let n = self.registry.broadcast_to_record(record_id, &text, except);
        self.metrics.frames_sent.inc_by(n as u64);
        Ok(n)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::presence::MemoryPresenceStore;
    use crate::protocol::ActiveSession;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts calls and optionally fails every one of them.
    #[derive(Default)]
    pub(crate) struct ScriptedStore {
        inner: MemoryPresenceStore,
        pub calls: AtomicUsize,
        pub fail: bool,
    }

    impl ScriptedStore {
        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        fn hit(&self) -> Result<(), CollabError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(CollabError::PresenceStore("connection refused".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl PresenceStore for ScriptedStore {
        async fn upsert(&self, record_id: &RecordId, user_id: UserId) -> Result<(), CollabError> {
            self.hit()?;
            self.inner.upsert(record_id, user_id).await
        }

        async fn query_active(&self, record_id: &RecordId) -> Result<Vec<ActiveSession>, CollabError> {
            self.hit()?;
            self.inner.query_active(record_id).await
        }

        async fn deactivate(&self, record_id: &RecordId, user_id: UserId) -> Result<(), CollabError> {
            self.hit()?;
            self.inner.deactivate(record_id, user_id).await
        }

        async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, CollabError> {
            self.hit()?;
            self.inner.purge_before(cutoff).await
        }
    }

    fn hub_with(store: Arc<dyn PresenceStore>) -> Hub {
        Hub::new(store, Arc::new(Metrics::new().unwrap()), 64)
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    fn join(record: &str, uid: UserId) -> String {
        json!({"type": "join", "recordId": record, "userId": uid}).to_string()
    }

    #[tokio::test]
    async fn two_observers_coedit_a_walkthrough() {
        let store = Arc::new(MemoryPresenceStore::new());
        let hub = hub_with(store.clone());
        let (a, mut rx_a) = hub.on_connect();
        let (b, mut rx_b) = hub.on_connect();

        hub.on_message(a.conn_id, &join("W1", 1)).await;
        hub.on_message(b.conn_id, &join("W1", 2)).await;
        assert_eq!(store.query_active(&"W1".into()).await.unwrap().len(), 2);

        // Both saw presence lists; the latest one has both users.
        let last_b = drain(&mut rx_b).pop().unwrap();
        match last_b {
            ServerMessage::Presence { record_id, sessions } => {
                assert_eq!(record_id.as_str(), "W1");
                assert_eq!(sessions.len(), 2);
            }
            other => panic!("expected presence, got {other:?}"),
        }
        drain(&mut rx_a);

        let update = json!({
            "type": "update",
            "recordId": "W1",
            "fieldName": "subject",
            "fieldValue": "Math",
            "userId": 1
        })
        .to_string();
        let outcome = hub.on_message(a.conn_id, &update).await;
        assert_eq!(outcome, Some(Dispatch::Broadcast { recipients: 1 }));

        let got_b = drain(&mut rx_b);
        assert_eq!(
            got_b,
            vec![ServerMessage::FieldUpdate {
                record_id: "W1".into(),
                field_name: "subject".into(),
                field_value: json!("Math"),
                updated_by: 1,
            }]
        );
        assert!(drain(&mut rx_a).is_empty());
    }

    #[tokio::test]
    async fn draft_record_never_touches_the_store() {
        let store = Arc::new(ScriptedStore::default());
        let hub = hub_with(store.clone());
        let (a, mut rx) = hub.on_connect();

        for raw in [
            join("new", 1),
            json!({"type":"update","recordId":"new","fieldName":"notes","fieldValue":"x","userId":1})
                .to_string(),
            json!({"type":"leave","recordId":"new","userId":1}).to_string(),
        ] {
            assert_eq!(hub.on_message(a.conn_id, &raw).await, Some(Dispatch::SentinelSkip));
        }
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_and_connection_survives() {
        let hub = hub_with(Arc::new(MemoryPresenceStore::new()));
        let (a, mut rx) = hub.on_connect();

        assert_eq!(hub.on_message(a.conn_id, "{not json").await, None);
        assert_eq!(hub.on_message(a.conn_id, r#"{"type":"shout"}"#).await, None);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(hub.registry().len(), 1);

        // still serviceable afterwards
        assert!(hub.on_message(a.conn_id, &join("W1", 1)).await.is_some());
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn store_failure_skips_broadcast_only() {
        let hub = hub_with(Arc::new(ScriptedStore::failing()));
        let (a, mut rx_a) = hub.on_connect();
        let (b, mut rx_b) = hub.on_connect();

        assert_eq!(hub.on_message(a.conn_id, &join("W1", 1)).await, None);
        assert_eq!(hub.on_message(b.conn_id, &join("W1", 2)).await, None);
        assert!(drain(&mut rx_a).is_empty());
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(hub.registry().len(), 2);

        // pings do not depend on the store
        assert_eq!(hub.on_message(a.conn_id, r#"{"type":"ping"}"#).await, Some(Dispatch::Pong));
        assert_eq!(rx_a.try_recv().unwrap(), PONG_JSON);
    }

    #[tokio::test]
    async fn store_failure_on_update_sends_no_field_update() {
        let store = Arc::new(ScriptedStore::failing());
        let hub = hub_with(store.clone());
        let (a, mut rx_a) = hub.on_connect();
        let (b, mut rx_b) = hub.on_connect();
        hub.on_message(a.conn_id, &join("W1", 1)).await;
        hub.on_message(b.conn_id, &join("W1", 2)).await;
        assert_eq!(hub.registry().subscribers(&"W1".into()).len(), 2);

        let update = json!({
            "type": "update", "recordId": "W1", "fieldName": "subject", "fieldValue": "Math", "userId": 1
        })
        .to_string();
        assert_eq!(hub.on_message(a.conn_id, &update).await, None);
        assert!(drain(&mut rx_a).is_empty());
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(hub.registry().len(), 2);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn store_failure_on_leave_still_unsubscribes() {
        let hub = hub_with(Arc::new(ScriptedStore::failing()));
        let (a, mut rx_a) = hub.on_connect();
        let (b, mut rx_b) = hub.on_connect();
        hub.on_message(a.conn_id, &join("W1", 1)).await;
        hub.on_message(b.conn_id, &join("W1", 2)).await;

        let leave = json!({"type":"leave","recordId":"W1","userId":1}).to_string();
        assert_eq!(hub.on_message(a.conn_id, &leave).await, None);
        assert!(drain(&mut rx_a).is_empty());
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(hub.registry().subscribers(&"W1".into()), vec![b.conn_id]);
        assert_eq!(hub.registry().len(), 2);
    }

    #[tokio::test]
    async fn leave_rebroadcasts_and_unsubscribes() {
        let store = Arc::new(MemoryPresenceStore::new());
        let hub = hub_with(store.clone());
        let (a, mut rx_a) = hub.on_connect();
        let (b, mut rx_b) = hub.on_connect();
        hub.on_message(a.conn_id, &join("W1", 1)).await;
        hub.on_message(b.conn_id, &join("W1", 2)).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        let leave = json!({"type":"leave","recordId":"W1","userId":1}).to_string();
        assert_eq!(
            hub.on_message(a.conn_id, &leave).await,
            Some(Dispatch::Broadcast { recipients: 2 })
        );
        for rx in [&mut rx_a, &mut rx_b] {
            match drain(rx).as_slice() {
                [ServerMessage::Presence { sessions, .. }] => {
                    assert_eq!(sessions.len(), 1);
                    assert_eq!(sessions[0].user.id, 2);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(hub.registry().subscribers(&"W1".into()), vec![b.conn_id]);
    }

    #[tokio::test]
    async fn close_keeps_presence_until_it_ages_out() {
        let store = Arc::new(MemoryPresenceStore::new());
        let hub = hub_with(store.clone());
        let (a, _rx) = hub.on_connect();
        hub.on_message(a.conn_id, &join("W1", 1)).await;

        hub.on_close(a.conn_id);
        assert!(hub.registry().is_empty());
        assert_eq!(store.query_active(&"W1".into()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn other_records_do_not_see_updates() {
        let hub = hub_with(Arc::new(MemoryPresenceStore::new()));
        let (a, _rx_a) = hub.on_connect();
        let (c, mut rx_c) = hub.on_connect();
        hub.on_message(a.conn_id, &join("W1", 1)).await;
        hub.on_message(c.conn_id, &join("W2", 3)).await;
        drain(&mut rx_c);

        let update = json!({
            "type": "update", "recordId": "W1", "fieldName": "grade", "fieldValue": 4, "userId": 1
        })
        .to_string();
        assert_eq!(
            hub.on_message(a.conn_id, &update).await,
            Some(Dispatch::Broadcast { recipients: 0 })
        );
        assert!(drain(&mut rx_c).is_empty());
    }
}
