//! Relay instrumentation.
//!
//! Recorded through the `metrics` facade; the server installs the
//! Prometheus exporter and describes these names.

use metrics::{counter, gauge, histogram};

/// Metric names.
pub mod names {
    pub const SESSIONS_TOTAL: &str = "relay_sessions_total";
    pub const SESSIONS_ACTIVE: &str = "relay_sessions_active";
    pub const CHANNELS_SUBSCRIBED: &str = "relay_channels_subscribed";
    pub const NOTIFICATIONS_TOTAL: &str = "relay_notifications_total";
    pub const NOTIFICATIONS_SKIPPED: &str = "relay_notifications_skipped_total";
    pub const FRAMES_DELIVERED: &str = "relay_frames_delivered_total";
    pub const DELIVERY_FAILURES: &str = "relay_delivery_failures_total";
    pub const SOURCE_LATENCY_MS: &str = "relay_source_latency_ms";
    pub const LISTENER_FAILURES: &str = "relay_listener_failures_total";
}

/// Record a session joining.
pub fn record_session_connected(active: usize) {
    counter!(names::SESSIONS_TOTAL).increment(1);
    gauge!(names::SESSIONS_ACTIVE).set(active as f64);
}

/// Record a session leaving.
pub fn record_session_disconnected(active: usize) {
    gauge!(names::SESSIONS_ACTIVE).set(active as f64);
}

/// Update the number of channels subscribed at the store.
pub fn set_subscribed_channels(count: usize) {
    gauge!(names::CHANNELS_SUBSCRIBED).set(count as f64);
}

/// Record a notification taken off the pub/sub stream.
pub fn record_notification() {
    counter!(names::NOTIFICATIONS_TOTAL).increment(1);
}

/// Record a notification dropped before broadcast.
pub fn record_skipped(reason: &'static str) {
    counter!(names::NOTIFICATIONS_SKIPPED, "reason" => reason).increment(1);
}

/// Record frames handed to sessions.
pub fn record_delivered(kind: &'static str, count: usize) {
    counter!(names::FRAMES_DELIVERED, "kind" => kind).increment(count as u64);
}

/// Record a frame a session refused.
pub fn record_delivery_failure() {
    counter!(names::DELIVERY_FAILURES).increment(1);
}

/// Record producer-to-relay latency.
pub fn record_source_latency(ms: i64) {
    histogram!(names::SOURCE_LATENCY_MS).record(ms as f64);
}

/// Record the listener dying on a store error.
pub fn record_listener_failure() {
    counter!(names::LISTENER_FAILURES).increment(1);
}
