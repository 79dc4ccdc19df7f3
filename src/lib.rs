//! Real-time co-editing engine for walkthrough records: WebSocket hub, presence tracking, and a
//! reconnecting client.

pub mod client;
pub mod config;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod maintenance;
pub mod metrics;
pub mod models;
pub mod presence;
pub mod protocol;
pub mod schema;
pub mod ws_registry;

use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::hub::Hub;
use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(store: Arc<dyn presence::PresenceStore>, send_buffer: usize) -> Result<Self, error::CollabError> {
        let metrics = Arc::new(
            Metrics::new().map_err(|e| error::CollabError::Config(format!("metrics: {e}")))?,
        );
        let hub = Arc::new(Hub::new(store, metrics.clone(), send_buffer));
        Ok(Self { hub, metrics })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/ws", get(handlers::ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
