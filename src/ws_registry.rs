//! WebSocket connection registry: live connections by id, per-record subscriber groups, targeted
//! broadcast, and stale-connection pruning.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::RecordId;

pub type ConnId = u64;

/// Per-connection state: sender to push frames to the socket task, last activity for timeout.
#[derive(Debug)]
pub struct ConnectionEntry {
    pub conn_id: ConnId,
    pub tx: mpsc::Sender<String>,
    /// Unix timestamp (seconds) of the last frame received from the client.
    pub last_seen_at: AtomicU64,
    /// Cancelled when the registry evicts the connection; the socket task exits on it.
    pub shutdown: CancellationToken,
}

impl ConnectionEntry {
    pub fn touch(&self) {
        self.last_seen_at.store(now_secs(), Ordering::Relaxed);
    }
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of live connections. Thread-safe; owned by the hub and shared via Arc.
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    buffer: usize,
    connections: DashMap<ConnId, Arc<ConnectionEntry>>,
    /// record id -> connections that joined it.
    groups: DashMap<RecordId, HashSet<ConnId>>,
}

impl ConnectionRegistry {
    pub fn new(buffer: usize) -> Self {
        Self {
            next_id: AtomicU64::new(0),
            buffer: buffer.max(1),
            connections: DashMap::new(),
            groups: DashMap::new(),
        }
    }

    /// Register a new connection. Returns the entry and the receiver for the send task.
    /// Caller must call `remove_connection(conn_id)` when the socket closes.
    pub fn register(&self) -> (Arc<ConnectionEntry>, mpsc::Receiver<String>) {
        let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        let entry = Arc::new(ConnectionEntry {
            conn_id,
            tx,
            last_seen_at: AtomicU64::new(now_secs()),
            shutdown: CancellationToken::new(),
        });
        self.connections.insert(conn_id, entry.clone());
        (entry, rx)
    }

    /// Remove a connection and drop it from every group. Returns false if it was already gone.
    pub fn remove_connection(&self, conn_id: ConnId) -> bool {
        let removed = self.connections.remove(&conn_id).is_some();
        self.groups.retain(|_, members| {
            members.remove(&conn_id);
            !members.is_empty()
        });
        removed
    }

    pub fn subscribe(&self, record_id: &RecordId, conn_id: ConnId) {
        if !self.connections.contains_key(&conn_id) {
            return;
        }
        self.groups
            .entry(record_id.clone())
            .or_default()
            .insert(conn_id);
    }

    pub fn unsubscribe(&self, record_id: &RecordId, conn_id: ConnId) {
        let mut empty = false;
        if let Some(mut members) = self.groups.get_mut(record_id) {
            members.remove(&conn_id);
            empty = members.is_empty();
        }
        if empty {
            self.groups.remove_if(record_id, |_, members| members.is_empty());
        }
    }

    pub fn subscribers(&self, record_id: &RecordId) -> Vec<ConnId> {
        self.groups
            .get(record_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Push a frame to one connection. False if the connection is gone or its buffer is full.
    pub fn send_to(&self, conn_id: ConnId, message: &str) -> bool {
        match self.connections.get(&conn_id) {
            Some(entry) => entry.tx.try_send(message.to_string()).is_ok(),
            None => false,
        }
    }

    /// Send a frame to every subscriber of `record_id` except `except`. Returns how many
    /// connections accepted it. Full buffers are logged and skipped, never disconnected here.
    pub fn broadcast_to_record(
        &self,
        record_id: &RecordId,
        message: &str,
        except: Option<ConnId>,
    ) -> usize {
        let targets = self.subscribers(record_id);
        let mut delivered = 0;
        for conn_id in targets {
            if Some(conn_id) == except {
                continue;
            }
            if self.send_to(conn_id, message) {
                delivered += 1;
            } else {
                tracing::debug!(conn_id, %record_id, "ws broadcast try_send failed");
            }
        }
        delivered
    }

    /// Evict connections with no inbound frame for more than `max_age_secs`.
    /// Call periodically from a background task. Returns the evicted ids.
    pub fn prune_stale(&self, max_age_secs: u64) -> Vec<ConnId> {
        let now = now_secs();
        let stale: Vec<ConnId> = self
            .connections
            .iter()
            .filter(|e| now.saturating_sub(e.last_seen_at.load(Ordering::Relaxed)) > max_age_secs)
            .map(|e| e.conn_id)
            .collect();
        for &conn_id in &stale {
            if let Some((_, entry)) = self.connections.remove(&conn_id) {
                entry.shutdown.cancel();
            }
        }
        if !stale.is_empty() {
            self.groups.retain(|_, members| {
                members.retain(|id| !stale.contains(id));
                !members.is_empty()
            });
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(64)
    }
}
