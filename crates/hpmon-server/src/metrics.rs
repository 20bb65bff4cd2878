//! Metrics collection and export for the hpmon server.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "hpmon_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "hpmon_connections_active";
    pub const CONNECTIONS_REJECTED: &str = "hpmon_connections_rejected_total";
    pub const FRAMES_TOTAL: &str = "hpmon_frames_total";
    pub const FRAMES_BYTES: &str = "hpmon_frames_bytes";
    pub const ROOMS_ACTIVE: &str = "hpmon_rooms_active";
    pub const SUBSCRIPTIONS_TOTAL: &str = "hpmon_subscriptions_total";
    pub const BROADCASTS_TOTAL: &str = "hpmon_broadcasts_total";
    pub const LATENCY_SECONDS: &str = "hpmon_frame_latency_seconds";
    pub const ERRORS_TOTAL: &str = "hpmon_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::CONNECTIONS_REJECTED,
        "Connections refused because the connection limit was reached"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::FRAMES_BYTES, "Total bytes of frames processed");
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Current number of rooms");
    metrics::describe_counter!(names::SUBSCRIPTIONS_TOTAL, "Total number of room joins");
    metrics::describe_counter!(
        names::BROADCASTS_TOTAL,
        "Metric and dashboard broadcasts accepted over HTTP"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound frame processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a connection refused at the limit.
pub fn record_rejected() {
    counter!(names::CONNECTIONS_REJECTED).increment(1);
}

/// Record a frame.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record frame processing latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record room joins.
pub fn record_subscriptions(count: usize) {
    counter!(names::SUBSCRIPTIONS_TOTAL).increment(count as u64);
}

/// Record an HTTP broadcast.
pub fn record_broadcast(kind: &'static str) {
    counter!(names::BROADCASTS_TOTAL, "kind" => kind).increment(1);
}

/// Update the active room count.
pub fn set_active_rooms(count: usize) {
    gauge!(names::ROOMS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        let _guard = ConnectionMetricsGuard::new();
        record_frame(128, "inbound");
        record_subscriptions(3);
        set_active_rooms(2);
    }
}
