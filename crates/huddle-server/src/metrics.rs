//! Metrics collection and export for Huddle.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use anyhow::{Context, Result};
use huddle_core::{DispatchStats, PoolStats};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "huddle_connections_total";
    pub const SESSIONS_ACTIVE: &str = "huddle_sessions_active";
    pub const MESSAGES_TOTAL: &str = "huddle_messages_total";
    pub const PROTOCOL_ERRORS_TOTAL: &str = "huddle_protocol_errors_total";
    pub const DELIVERY_FAILURES_TOTAL: &str = "huddle_delivery_failures_total";
    pub const GLYPHS_AVAILABLE: &str = "huddle_glyphs_available";
    pub const PROXIMITY_FRAMES_TOTAL: &str = "huddle_proximity_frames_total";
    pub const INBOUND_FPS: &str = "huddle_inbound_fps";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Current number of live sessions");
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of messages processed");
    metrics::describe_counter!(
        names::PROTOCOL_ERRORS_TOTAL,
        "Inbound messages rejected as malformed"
    );
    metrics::describe_counter!(
        names::DELIVERY_FAILURES_TOTAL,
        "Outbound sends that could not be queued"
    );
    metrics::describe_gauge!(names::GLYPHS_AVAILABLE, "Glyphs waiting to be handed out");
    metrics::describe_counter!(
        names::PROXIMITY_FRAMES_TOTAL,
        "Upstream proximity frames, by frame gate decision"
    );
    metrics::describe_gauge!(names::INBOUND_FPS, "Measured rate of upstream proximity frames");

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
    gauge!(names::SESSIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::SESSIONS_ACTIVE).decrement(1.0);
}

/// Force the live-session gauge to zero once every connection task is done.
pub fn reset_sessions() {
    gauge!(names::SESSIONS_ACTIVE).set(0.0);
}

/// Record a message.
pub fn record_message(direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
}

/// Record a malformed inbound message.
pub fn record_protocol_error() {
    counter!(names::PROTOCOL_ERRORS_TOTAL).increment(1);
}

/// Record failed sends.
pub fn record_delivery_failures(count: usize) {
    if count > 0 {
        counter!(names::DELIVERY_FAILURES_TOTAL).increment(count as u64);
    }
}

/// Update the pool gauge.
pub fn record_pool(stats: PoolStats) {
    gauge!(names::GLYPHS_AVAILABLE).set(stats.available as f64);
}

/// Record the outcome of one upstream tick.
pub fn record_dispatch(stats: &DispatchStats, carried_proximity: bool, inbound_fps: f64) {
    if carried_proximity {
        let admitted = if stats.proximity_admitted { "true" } else { "false" };
        counter!(names::PROXIMITY_FRAMES_TOTAL, "admitted" => admitted).increment(1);
        gauge!(names::INBOUND_FPS).set(inbound_fps);
    }
    record_delivery_failures(stats.delivery_failures);
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
