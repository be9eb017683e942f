//! Metrics definitions for the SFU.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sfu_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `actor_type`: 3 values (registry, room, connection)
//! - `operation`: bounded by `EngineOp` (15 values)
//! - `status`: success, error
//! - `message_type`: bounded by signaling request types (~15 values)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Signaling round trips, including engine work behind them
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_signaling".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500,
            ],
        )
        .map_err(|e| format!("Failed to set signaling latency buckets: {e}"))?
        // Engine calls are local IPC
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_engine".to_string()),
            &[
                0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set engine latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Room & Connection Metrics (Gauges)
// ============================================================================

/// Set the number of active rooms.
///
/// Metric: `sfu_rooms_active`
pub fn set_rooms_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_rooms_active").set(count as f64);
}

/// Set the number of participants across all rooms.
///
/// Metric: `sfu_participants_active`
pub fn set_participants_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_participants_active").set(count as f64);
}

/// Set the number of open signaling connections.
///
/// Metric: `sfu_connections_active`
pub fn set_connections_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_connections_active").set(count as f64);
}

// ============================================================================
// Latency Metrics (Histograms)
// ============================================================================

/// Record signaling request handling latency.
///
/// Metric: `sfu_signaling_latency_seconds`
/// Labels: `message_type`, `status`
pub fn record_signaling_latency(message_type: &str, status: &str, duration: Duration) {
    histogram!(
        "sfu_signaling_latency_seconds",
        "message_type" => message_type.to_string(),
        "status" => status.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a media engine call.
///
/// Metric: `sfu_engine_call_latency_seconds`
/// Labels: `operation`, `status`
pub fn record_engine_call(operation: &str, status: &str, duration: Duration) {
    histogram!(
        "sfu_engine_call_latency_seconds",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .record(duration.as_secs_f64());
}

// ============================================================================
// Counters
// ============================================================================

/// Record a room event dropped because a participant's queue was full.
///
/// Metric: `sfu_events_dropped_total`
pub fn record_event_dropped() {
    counter!("sfu_events_dropped_total").increment(1);
}

/// Record an unexpected engine worker death.
///
/// Metric: `sfu_worker_deaths_total`
///
/// ALERT: the process exits shortly after this is recorded.
pub fn record_worker_death() {
    counter!("sfu_worker_deaths_total").increment(1);
}

/// Record an actor panic event.
///
/// Metric: `sfu_actor_panics_total`
/// Labels: `actor_type`
///
/// ALERT: Any non-zero value indicates a bug and should trigger investigation.
pub fn record_actor_panic(actor_type: &str) {
    counter!("sfu_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}
