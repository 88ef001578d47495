//! Prometheus metrics exposition
//!
//! The library crates emit through the `metrics` facade:
//!
//! - `weakpass_attempts_total` (counter): label `status`
//! - `weakpass_attempt_duration_seconds` (histogram): label `status`
//! - `weakpass_in_flight` (gauge)
//! - `weakpass_proxy_disabled_total` (counter)
//!
//! This module adds the session progress gauges and installs the recorder.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("weakpass_attempt_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Attempt durations render as a histogram with buckets from 5ms to 60s,
/// which covers every sensible attempt timeout.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Session-wide progress, updated on every completion.
pub fn record_progress(done: usize, total: usize) {
    metrics::gauge!("weakpass_session_completed_targets").set(done as f64);
    metrics::gauge!("weakpass_session_total_targets").set(total as f64);
}
