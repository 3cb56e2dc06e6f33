//! Metrics collection and export for the relay.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use relay_core::{BroadcastStats, Broadcaster, HeartbeatSummary, SessionSummary};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "relay_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
    pub const RECEIVERS_ACTIVE: &str = "relay_receivers_active";
    pub const HISTORY_LENGTH: &str = "relay_history_length";
    pub const MESSAGES_PUBLISHED: &str = "relay_messages_published_total";
    pub const DELIVERIES_TOTAL: &str = "relay_deliveries_total";
    pub const DELIVERIES_DROPPED: &str = "relay_deliveries_dropped_total";
    pub const REJECTED_TOTAL: &str = "relay_rejected_total";
    pub const HEARTBEATS_TOTAL: &str = "relay_heartbeats_total";
    pub const SUBMIT_LATENCY_SECONDS: &str = "relay_submit_latency_seconds";
    pub const ERRORS_TOTAL: &str = "relay_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open connections"
    );
    metrics::describe_gauge!(names::RECEIVERS_ACTIVE, "Currently registered receivers");
    metrics::describe_gauge!(names::HISTORY_LENGTH, "Messages currently retained");
    metrics::describe_counter!(names::MESSAGES_PUBLISHED, "Messages accepted into history");
    metrics::describe_counter!(names::DELIVERIES_TOTAL, "Messages enqueued to receivers");
    metrics::describe_counter!(
        names::DELIVERIES_DROPPED,
        "Deliveries dropped because a receiver was full or gone"
    );
    metrics::describe_counter!(names::REJECTED_TOTAL, "Rejected inbound submissions");
    metrics::describe_counter!(names::HEARTBEATS_TOTAL, "Heartbeat markers sent");
    metrics::describe_histogram!(
        names::SUBMIT_LATENCY_SECONDS,
        "HTTP submit latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Publish broadcaster statistics as gauges and counters.
pub fn report_stats(stats: &BroadcastStats) {
    gauge!(names::RECEIVERS_ACTIVE).set(stats.receivers as f64);
    gauge!(names::HISTORY_LENGTH).set(stats.history_len as f64);
    counter!(names::MESSAGES_PUBLISHED).absolute(stats.published);
    counter!(names::DELIVERIES_TOTAL).absolute(stats.delivered);
    counter!(names::DELIVERIES_DROPPED).absolute(stats.dropped);
}

/// Periodically report broadcaster statistics.
pub fn spawn_stats_reporter(broadcaster: Arc<Broadcaster>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            report_stats(&broadcaster.stats());
        }
    })
}

/// Record the outcome of a finished message session.
pub fn record_session(summary: &SessionSummary) {
    if summary.rejected > 0 {
        counter!(names::REJECTED_TOTAL, "source" => "websocket").increment(summary.rejected);
    }
    if summary.reason.is_fault() {
        record_error("session");
    }
}

/// Record the outcome of a finished heartbeat connection.
pub fn record_heartbeat(summary: &HeartbeatSummary) {
    counter!(names::HEARTBEATS_TOTAL).increment(summary.beats);
    if summary.reason.is_fault() {
        record_error("heartbeat");
    }
}

/// Record a rejected HTTP submission.
pub fn record_http_rejection() {
    counter!(names::REJECTED_TOTAL, "source" => "http").increment(1);
}

/// Record HTTP submit latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::SUBMIT_LATENCY_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard {
    kind: &'static str,
}

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection of the given kind.
    #[must_use]
    pub fn new(kind: &'static str) -> Self {
        counter!(names::CONNECTIONS_TOTAL, "kind" => kind).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE, "kind" => kind).increment(1.0);
        Self { kind }
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::CONNECTIONS_ACTIVE, "kind" => self.kind).decrement(1.0);
    }
}
