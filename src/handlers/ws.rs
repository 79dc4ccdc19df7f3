//! WebSocket handler: one task per socket, forwarding frames between the client and the hub.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use std::sync::Arc;
use tracing::trace;

use crate::hub::Hub;
use crate::AppState;

/// GET /ws — Upgrades to a collaboration socket. Identity arrives later via `join`.
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(mut socket: WebSocket, hub: Arc<Hub>) {
    let (entry, mut rx) = hub.on_connect();
    let conn_id = entry.conn_id;
    loop {
        tokio::select! {
            _ = entry.shutdown.cancelled() => {
                trace!(conn_id, "ws evicted after inactivity");
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            msg = rx.recv() => {
                match msg {
                    Some(text) => {
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        entry.touch();
                        trace!(conn_id, "ws frame received");
                        hub.on_message(conn_id, text.as_str()).await;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }
    hub.on_close(conn_id);
}
