use std::sync::Arc;

use diesel::r2d2::{ConnectionManager, Pool};
use diesel::PgConnection;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use walkthrough_collab::config::Config;
use walkthrough_collab::presence::{self, MemoryPresenceStore, PgPresenceStore, PresenceStore};
use walkthrough_collab::{maintenance, router, AppState};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env().expect("Invalid configuration");

    let store: Arc<dyn PresenceStore> = match &config.database_url {
        Some(database_url) => {
            let manager = ConnectionManager::<PgConnection>::new(database_url);
            let pool = Pool::builder()
                .build(manager)
                .expect("Failed to create pool");
            presence::run_migrations(&pool).expect("Failed to run migrations");
            tracing::info!("presence backed by postgres");
            Arc::new(PgPresenceStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, presence kept in memory");
            Arc::new(MemoryPresenceStore::new())
        }
    };

    let state = AppState::new(store, config.send_buffer).expect("Failed to build app state");
    let shutdown = CancellationToken::new();
    let housekeeping = maintenance::spawn(state.hub.clone(), &config, shutdown.clone());

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await.unwrap();
    tracing::info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .unwrap();

    shutdown.cancel();
    let _ = housekeeping.await;
}
