//! Metrics definitions for the validator.
//!
//! All metrics follow Prometheus naming conventions:
//! - `validator_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `phase`: 3 values
//! - `status`: 4 values
//! - `operation`: bounded by cluster client methods (~10 values)
//!
//! Check names are never used as labels.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and return the handle used to render
/// the exposition text at the end of a run.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Check durations range from sub-second probes to multi-minute rollouts
        .set_buckets_for_metric(
            Matcher::Full("validator_check_duration_seconds".to_string()),
            &[0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0],
        )
        .map_err(|e| format!("Failed to set check duration buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

/// Record a terminal check result.
///
/// Metric: `validator_check_results_total`, `validator_check_duration_seconds`
/// Labels: `phase`, `status`
pub fn record_check_result(phase: &'static str, status: &'static str, duration: Duration) {
    counter!("validator_check_results_total", "phase" => phase, "status" => status).increment(1);
    histogram!("validator_check_duration_seconds", "phase" => phase).record(duration.as_secs_f64());
}

/// Record a retry of a cluster call.
///
/// Metric: `validator_retries_total`
/// Labels: `operation`
pub fn record_retry(operation: &str) {
    counter!("validator_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record a breaker transition to open.
///
/// Metric: `validator_breaker_open_total`
/// Labels: `operation`
pub fn record_breaker_opened(operation: &str) {
    counter!("validator_breaker_open_total", "operation" => operation.to_string()).increment(1);
}

/// Record a resource whose deletion needed forced finalizer removal.
///
/// Metric: `validator_cleanup_degraded_total`
/// Labels: `kind`
pub fn record_cleanup_degraded(kind: &'static str) {
    counter!("validator_cleanup_degraded_total", "kind" => kind).increment(1);
}

/// Record checks reported stalled by the watchdog.
///
/// Metric: `validator_stalled_checks`
pub fn set_stalled_checks(count: usize) {
    // usize to f64 conversion is safe for realistic check counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("validator_stalled_checks").set(count as f64);
}

/// Track open test environments.
///
/// Metric: `validator_environments_active`
pub fn environment_opened() {
    gauge!("validator_environments_active").increment(1.0);
}

/// See [`environment_opened`].
pub fn environment_closed() {
    gauge!("validator_environments_active").decrement(1.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        // The metrics facade drops everything when no recorder is installed.
        record_check_result("pre-deployment", "pass", Duration::from_millis(10));
        record_retry("create");
        record_breaker_opened("delete");
        record_cleanup_degraded("namespace");
        set_stalled_checks(2);
        environment_opened();
        environment_closed();
    }
}
