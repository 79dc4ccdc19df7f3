//! Background housekeeping: evict silent sockets, optionally purge old presence rows.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::hub::Hub;

pub fn spawn(hub: Arc<Hub>, config: &Config, shutdown: CancellationToken) -> JoinHandle<()> {
    let every = Duration::from_secs(config.prune_interval_secs);
    let ping_timeout = config.ping_timeout_secs;
    let retention_days = config.retention_days;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => run_once(&hub, ping_timeout, retention_days).await,
            }
        }
    })
}

pub async fn run_once(hub: &Hub, ping_timeout_secs: u64, retention_days: Option<i64>) {
    let evicted = hub.registry().prune_stale(ping_timeout_secs);
    if !evicted.is_empty() {
        info!(count = evicted.len(), "evicted idle ws connections");
    }

    let Some(days) = retention_days else {
        return;
    };
    let cutoff = Utc::now() - chrono::Duration::days(days);
    match hub.store().purge_before(cutoff).await {
        Ok(0) => {}
        Ok(n) => info!(rows = n, %cutoff, "purged old presence rows"),
        Err(e) => error!("presence purge: {}", e),
    }
}
