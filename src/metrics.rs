//! Prometheus Metrics for the SafeChat Relay
//!
//! Provides observability metrics for monitoring the relay server.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use std::sync::Arc;
use tracing::warn;

/// Relay server metrics.
#[derive(Clone)]
pub struct RelayMetrics {
    /// Registry for all metrics.
    pub registry: Arc<Registry>,

    // Connection metrics
    /// Total WebSocket connections accepted.
    pub connections_total: IntCounter,
    /// Current active WebSocket connections.
    pub connections_active: IntGauge,
    /// Connection errors (upgrade failures, transport errors).
    pub connection_errors: IntCounter,
    /// Handshakes closed because the path identity did not resolve.
    pub handshakes_rejected: IntCounter,

    // Message metrics
    /// Total chat frames received.
    pub messages_received: IntCounter,
    /// Chat messages decrypted, stored and fanned out.
    pub messages_relayed: IntCounter,
    /// Messages answered with an error frame.
    pub messages_rejected: IntCounter,
    /// Relayed messages whose claimed digest did not match.
    pub integrity_failures: IntCounter,
    /// Relay duration in seconds, decrypt through fan-out.
    pub relay_duration: Histogram,

    // Delivery metrics
    /// Frames handed to a live connection.
    pub deliveries_live: IntCounter,
    /// Frames addressed to a user without a usable connection.
    pub deliveries_missed: IntCounter,

    // Storage metrics
    /// Current number of stored messages.
    pub messages_stored: IntGauge,

    // Rate limiting
    /// Requests rate limited.
    pub rate_limited: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::with_opts(Opts::new(name, help)).expect("valid counter definition");
    registry
        .register(Box::new(counter.clone()))
        .expect("counter registered once");
    counter
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::with_opts(Opts::new(name, help)).expect("valid gauge definition");
    registry
        .register(Box::new(gauge.clone()))
        .expect("gauge registered once");
    gauge
}

impl RelayMetrics {
    /// Creates a new metrics instance with all counters registered.
    pub fn new() -> Self {
        let registry = Registry::new();

        let relay_duration = Histogram::with_opts(
            HistogramOpts::new(
                "safechat_relay_duration_seconds",
                "Relay duration in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
        )
        .expect("valid histogram definition");
        registry
            .register(Box::new(relay_duration.clone()))
            .expect("histogram registered once");

        RelayMetrics {
            connections_total: counter(
                &registry,
                "safechat_connections_total",
                "Total WebSocket connections accepted",
            ),
            connections_active: gauge(
                &registry,
                "safechat_connections_active",
                "Current active WebSocket connections",
            ),
            connection_errors: counter(
                &registry,
                "safechat_connection_errors_total",
                "Total connection errors",
            ),
            handshakes_rejected: counter(
                &registry,
                "safechat_handshakes_rejected_total",
                "Total handshakes rejected for an unknown identity",
            ),
            messages_received: counter(
                &registry,
                "safechat_messages_received_total",
                "Total chat frames received",
            ),
            messages_relayed: counter(
                &registry,
                "safechat_messages_relayed_total",
                "Total chat messages relayed",
            ),
            messages_rejected: counter(
                &registry,
                "safechat_messages_rejected_total",
                "Total messages rejected",
            ),
            integrity_failures: counter(
                &registry,
                "safechat_integrity_failures_total",
                "Total relayed messages with a mismatched digest",
            ),
            relay_duration,
            deliveries_live: counter(
                &registry,
                "safechat_deliveries_live_total",
                "Total frames delivered to a live connection",
            ),
            deliveries_missed: counter(
                &registry,
                "safechat_deliveries_missed_total",
                "Total frames not delivered live",
            ),
            messages_stored: gauge(
                &registry,
                "safechat_messages_stored",
                "Current number of stored messages",
            ),
            rate_limited: counter(
                &registry,
                "safechat_rate_limited_total",
                "Total requests rate limited",
            ),
            registry: Arc::new(registry),
        }
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
