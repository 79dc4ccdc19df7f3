//! Client connection manager: one socket per `(user, record)` with automatic reconnection.
//!
//! The socket task owns the transport; [`CollabClient`] shares a [`ConnectionMachine`] with it so
//! callers can read status, presence, and the last message without talking to the socket.

pub mod backoff;
pub mod machine;

pub use backoff::{jitter_unit, RetryPolicy};
pub use machine::{CloseDecision, ConnectionMachine, ConnectionStatus, NORMAL_CLOSE};

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CollabError;
use crate::protocol::{ActiveSession, ClientMessage, RecordId, ServerMessage, UserId};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SharedMachine = Arc<Mutex<ConnectionMachine>>;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// e.g. `ws://localhost:3000/ws`
    pub url: String,
    pub user_id: Option<UserId>,
    pub record_id: Option<RecordId>,
    pub retry: RetryPolicy,
    /// How often an open socket sends `ping`. Keep well under the server's idle timeout.
    pub keepalive: Duration,
}

impl ClientConfig {
    pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(30);

    pub fn new(url: impl Into<String>, user_id: Option<UserId>, record_id: Option<RecordId>) -> Self {
        Self {
            url: url.into(),
            user_id,
            record_id,
            retry: RetryPolicy::default(),
            keepalive: Self::DEFAULT_KEEPALIVE,
        }
    }
}

/// Result of [`CollabClient::send_message`]. Offline messages are not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Dropped,
}

struct Session {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    outbound: mpsc::UnboundedSender<String>,
}

pub struct CollabClient {
    config: ClientConfig,
    machine: SharedMachine,
    events: broadcast::Sender<ServerMessage>,
    session: Mutex<Option<Session>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CollabClient {
    pub fn new(config: ClientConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            machine: Arc::new(Mutex::new(ConnectionMachine::new(
                config.retry,
                config.record_id.clone(),
            ))),
            config,
            events,
            session: Mutex::new(None),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        lock(&self.machine).status()
    }

    pub fn active_sessions(&self) -> Vec<ActiveSession> {
        lock(&self.machine).sessions().to_vec()
    }

    pub fn last_message(&self) -> Option<ServerMessage> {
        lock(&self.machine).last_message().cloned()
    }

    /// Every inbound server message, for the UI to apply field updates and show notices.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.events.subscribe()
    }

    /// Open the socket and keep it open. No-op without a user and record, or while already running.
    /// Must be called inside a tokio runtime.
    pub fn connect(&self) {
        let (Some(user_id), Some(record_id)) = (self.config.user_id, self.config.record_id.clone())
        else {
            debug!("collab connect skipped: missing user or record");
            return;
        };

        let mut session = lock(&self.session);
        if session.as_ref().is_some_and(|s| !s.task.is_finished()) {
            return;
        }

        let cancel = CancellationToken::new();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(
            self.config.url.clone(),
            SessionMessages::new(record_id, user_id),
            self.config.keepalive,
            self.machine.clone(),
            self.events.clone(),
            outbound_rx,
            cancel.clone(),
        ));
        *session = Some(Session {
            cancel,
            task,
            outbound,
        });
    }

    /// Send when the socket is open; otherwise the message is dropped and `Dropped` returned.
    pub fn send_message(&self, msg: &ClientMessage) -> SendOutcome {
        if self.status() != ConnectionStatus::Connected {
            return SendOutcome::Dropped;
        }
        let text = match serde_json::to_string(msg) {
            Ok(t) => t,
            Err(e) => {
                warn!("encode outbound: {}", e);
                return SendOutcome::Dropped;
            }
        };
        match lock(&self.session).as_ref() {
            Some(s) if s.outbound.send(text).is_ok() => SendOutcome::Sent,
            _ => SendOutcome::Dropped,
        }
    }

    /// Send a field edit for this client's record.
    pub fn send_update(&self, field_name: &str, field_value: serde_json::Value) -> SendOutcome {
        let (Some(user_id), Some(record_id)) = (self.config.user_id, self.config.record_id.clone())
        else {
            return SendOutcome::Dropped;
        };
        self.send_message(&ClientMessage::Update {
            record_id,
            field_name: field_name.to_string(),
            field_value,
            user_id,
        })
    }

    /// Best-effort `leave`, normal close, cancel any pending retry, reset to `Disconnected`.
    /// Safe to call repeatedly or before `connect`.
    pub async fn disconnect(&self) {
        let session = lock(&self.session).take();
        if let Some(s) = session {
            s.cancel.cancel();
            if let Err(e) = s.task.await {
                warn!("collab socket task ended abnormally: {}", e);
            }
        }
        lock(&self.machine).reset();
    }
}

impl Drop for CollabClient {
    fn drop(&mut self) {
        if let Some(s) = lock(&self.session).take() {
            s.cancel.cancel();
        }
    }
}

/// Pre-encoded `join`, `leave` and `ping` frames for one session.
struct SessionMessages {
    join: String,
    leave: String,
    ping: String,
}

impl SessionMessages {
    fn new(record_id: RecordId, user_id: UserId) -> Self {
        let encode = |m: &ClientMessage| serde_json::to_string(m).unwrap_or_default();
        Self {
            join: encode(&ClientMessage::Join {
                record_id: record_id.clone(),
                user_id,
            }),
            leave: encode(&ClientMessage::Leave { record_id, user_id }),
            ping: encode(&ClientMessage::Ping),
        }
    }
}

async fn run(
    url: String,
    frames: SessionMessages,
    keepalive: Duration,
    machine: SharedMachine,
    events: broadcast::Sender<ServerMessage>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    loop {
        lock(&machine).begin_connect();
        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            r = tokio_tungstenite::connect_async(url.as_str()) => r,
        };

        let decision = match connected {
            Ok((socket, _)) => {
                // Anything composed before this socket existed is stale.
                while outbound_rx.try_recv().is_ok() {}
                lock(&machine).on_open();
                info!(%url, "collab socket open");
                drive(socket, &frames, keepalive, &machine, &events, &mut outbound_rx, &cancel).await
            }
            Err(e) => {
                let err = CollabError::from(e);
                let mut m = lock(&machine);
                m.on_error(&err);
                m.on_close(None, jitter_unit())
            }
        };

        match decision {
            CloseDecision::Retry { delay, attempt } => {
                debug!(attempt, ?delay, "collab reconnect scheduled");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            CloseDecision::Stop => break,
        }
    }
    lock(&machine).reset();
}

/// Pump one open socket until it closes or the session is cancelled.
async fn drive(
    mut socket: Socket,
    frames: &SessionMessages,
    keepalive: Duration,
    machine: &SharedMachine,
    events: &broadcast::Sender<ServerMessage>,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    cancel: &CancellationToken,
) -> CloseDecision {
    if let Err(e) = socket.send(Message::text(frames.join.clone())).await {
        return transport_failure(machine, e.into());
    }

    // Any inbound frame keeps the server from evicting us; an observer who only watches sends none.
    let keepalive = keepalive.max(Duration::from_millis(1));
    let mut pings = tokio::time::interval_at(tokio::time::Instant::now() + keepalive, keepalive);
    pings.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(e) = socket.send(Message::text(frames.leave.clone())).await {
                    debug!("leave not delivered: {}", e);
                }
                let close = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "leave".into(),
                };
                if let Err(e) = socket.close(Some(close)).await {
                    debug!("close not delivered: {}", e);
                }
                return lock(machine).on_close(Some(NORMAL_CLOSE), 0.0);
            }
            _ = pings.tick() => {
                if let Err(e) = socket.send(Message::text(frames.ping.clone())).await {
                    return transport_failure(machine, e.into());
                }
            }
            out = outbound_rx.recv() => {
                let Some(text) = out else {
                    return CloseDecision::Stop;
                };
                if let Err(e) = socket.send(Message::text(text)).await {
                    return transport_failure(machine, e.into());
                }
            }
            frame = socket.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let parsed = lock(machine).on_text(text.as_str());
                        match parsed {
                            // No receivers is fine.
                            Ok(Some(msg)) => { let _ = events.send(msg); }
                            Ok(None) => {}
                            Err(e) => warn!("ignoring server frame: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.map(|f| u16::from(f.code));
                        debug!(?code, "collab socket closed by server");
                        return lock(machine).on_close(code, jitter_unit());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return transport_failure(machine, e.into()),
                    None => return lock(machine).on_close(None, jitter_unit()),
                }
            }
        }
    }
}

fn transport_failure(machine: &SharedMachine, err: CollabError) -> CloseDecision {
    let mut m = lock(machine);
    m.on_error(&err);
    m.on_close(None, jitter_unit())
}
