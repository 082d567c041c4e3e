//! Metrics export for the relay.
//!
//! The core crate records through the `metrics` facade; this module
//! describes those names, adds socket-level ones, and exports everything
//! in Prometheus format.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use relay_core::metrics::names as core;
use std::net::SocketAddr;
use tracing::info;

/// Socket-level metric names.
pub mod names {
    pub const SOCKETS_ACTIVE: &str = "relay_sockets_active";
    pub const SOCKET_ERRORS_TOTAL: &str = "relay_socket_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        core::SESSIONS_TOTAL,
        "Total number of sessions since server start"
    );
    metrics::describe_gauge!(core::SESSIONS_ACTIVE, "Current number of registered sessions");
    metrics::describe_gauge!(
        core::CHANNELS_SUBSCRIBED,
        "Channels currently subscribed at the store"
    );
    metrics::describe_counter!(
        core::NOTIFICATIONS_TOTAL,
        "Notifications received from the store"
    );
    metrics::describe_counter!(
        core::NOTIFICATIONS_SKIPPED,
        "Notifications dropped before broadcast, by reason"
    );
    metrics::describe_counter!(
        core::FRAMES_DELIVERED,
        "Frames handed to sessions, by kind"
    );
    metrics::describe_counter!(core::DELIVERY_FAILURES, "Frames refused by a session");
    metrics::describe_histogram!(
        core::SOURCE_LATENCY_MS,
        "Producer timestamp to relay receipt, in milliseconds"
    );
    metrics::describe_counter!(
        core::LISTENER_FAILURES,
        "Broadcast listener exits on store failure"
    );
    metrics::describe_gauge!(names::SOCKETS_ACTIVE, "Open WebSocket connections");
    metrics::describe_counter!(names::SOCKET_ERRORS_TOTAL, "WebSocket connections ended by an error");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a socket that ended with an error.
pub fn record_socket_error() {
    counter!(names::SOCKET_ERRORS_TOTAL).increment(1);
}

/// Guard that tracks an open socket until dropped.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording an open socket.
    #[must_use]
    pub fn new() -> Self {
        gauge!(names::SOCKETS_ACTIVE).increment(1.0);
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
        gauge!(names::SOCKETS_ACTIVE).decrement(1.0);
    }
}
