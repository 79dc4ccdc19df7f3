//! Prometheus metrics for the collaboration hub, exposed at `GET /metrics`.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,
    pub open_connections: IntGauge,
    pub messages: IntCounterVec,
    pub malformed_messages: IntCounter,
    pub store_failures: IntCounter,
    pub frames_sent: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let open_connections =
            IntGauge::new("collab_open_connections", "Open WebSocket connections")?;
        let messages = IntCounterVec::new(
            Opts::new("collab_messages_total", "Inbound protocol messages by type"),
            &["type"],
        )?;
        let malformed_messages =
            IntCounter::new("collab_malformed_messages_total", "Inbound frames that failed to parse")?;
        let store_failures =
            IntCounter::new("collab_presence_store_failures_total", "Presence store errors")?;
        let frames_sent =
            IntCounter::new("collab_frames_sent_total", "Outbound frames queued to connections")?;

        registry.register(Box::new(open_connections.clone()))?;
        registry.register(Box::new(messages.clone()))?;
        registry.register(Box::new(malformed_messages.clone()))?;
        registry.register(Box::new(store_failures.clone()))?;
        registry.register(Box::new(frames_sent.clone()))?;

        Ok(Self {
            registry,
            open_connections,
            messages,
            malformed_messages,
            store_failures,
            frames_sent,
        })
    }

    /// Text exposition format.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buf) {
            tracing::error!("encode metrics: {:?}", e);
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
