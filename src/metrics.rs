use std::net::SocketAddr;

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus::{Encoder, IntCounter, IntGauge, Opts, TextEncoder};
use tracing::{info, warn};

/// Relay throughput counters. Purely observational.
#[derive(Clone)]
pub struct RelayMetrics {
    pub events_consumed: IntCounter,
    pub messages_published: IntCounter,
    pub messages_rejected: IntCounter,
    pub messages_filtered: IntCounter,
    pub acknowledgments: IntCounter,
    pub window_messages: IntGauge,
    pub window_bytes: IntGauge,
    pub reread_rows: IntGauge,
}

impl RelayMetrics {
    pub fn new(slot: &str) -> Self {
        let registry = prometheus::default_registry();

        let counter = |name: &str, help: &str| {
            IntCounter::with_opts(Opts::new(name, help).const_label("slot", slot.to_string()))
                .expect("valid metric opts for relay counter")
        };
        let gauge = |name: &str, help: &str| {
            IntGauge::with_opts(Opts::new(name, help).const_label("slot", slot.to_string()))
                .expect("valid metric opts for relay gauge")
        };

        let events_consumed = counter(
            "wal_relay_events_consumed_total",
            "Total number of raw replication events consumed",
        );
        let messages_published = counter(
            "wal_relay_messages_published_total",
            "Total number of messages durably accepted by the publisher",
        );
        let messages_rejected = counter(
            "wal_relay_messages_rejected_total",
            "Total number of messages the publisher did not accept",
        );
        let messages_filtered = counter(
            "wal_relay_messages_filtered_total",
            "Total number of messages dropped by the operation filter",
        );
        let acknowledgments = counter(
            "wal_relay_acknowledgments_total",
            "Total number of replication positions acknowledged",
        );
        let window_messages = gauge(
            "wal_relay_window_messages",
            "Replication events consumed in the current send window",
        );
        let window_bytes = gauge(
            "wal_relay_window_bytes",
            "Replication payload bytes consumed in the current send window",
        );

        let reread_rows = gauge(
            "wal_relay_reread_rows",
            "Already consumed rows returned again by the last slot poll",
        );

        for metric in [
            Box::new(events_consumed.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(messages_published.clone()),
            Box::new(messages_rejected.clone()),
            Box::new(messages_filtered.clone()),
            Box::new(acknowledgments.clone()),
            Box::new(window_messages.clone()),
            Box::new(window_bytes.clone()),
            Box::new(reread_rows.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register relay metric: {}", e);
            }
        }

        Self {
            events_consumed,
            messages_published,
            messages_rejected,
            messages_filtered,
            acknowledgments,
            window_messages,
            window_bytes,
            reread_rows,
        }
    }
}

/// Encode everything in the default registry in the text exposition format.
pub fn encode_metrics() -> prometheus::Result<Vec<u8>> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(buffer)
}

pub async fn metrics_handler() -> Response {
    match encode_metrics() {
        Ok(buffer) => (
            [(header::CONTENT_TYPE, TextEncoder::new().format_type().to_string())],
            buffer,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

/// Serve `GET /metrics` on `addr` until the future is dropped.
pub async fn serve_metrics(addr: SocketAddr) -> std::io::Result<()> {
    let app = Router::new().route("/metrics", get(metrics_handler));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Serving Prometheus metrics");
    axum::serve(listener, app).await
}
