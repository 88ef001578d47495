//! Attempt metrics
//!
//! - `weakpass_attempts_total` (counter): label `status`
//! - `weakpass_attempt_duration_seconds` (histogram): label `status`
//! - `weakpass_in_flight` (gauge): attempts currently running
//!
//! `weakpass_proxy_disabled_total` is emitted by the proxy pool. Without an
//! installed recorder all of these are no-ops.

use common::LoginStatus;

/// Record a finished attempt.
pub fn record_attempt(status: LoginStatus, duration_secs: f64) {
    metrics::counter!("weakpass_attempts_total", "status" => status.label()).increment(1);
    metrics::histogram!("weakpass_attempt_duration_seconds", "status" => status.label())
        .record(duration_secs);
}

/// Holds `weakpass_in_flight` up for its lifetime.
pub(crate) struct InFlight;

impl InFlight {
    pub(crate) fn enter() -> Self {
        metrics::gauge!("weakpass_in_flight").increment(1.0);
        InFlight
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        metrics::gauge!("weakpass_in_flight").decrement(1.0);
    }
}
