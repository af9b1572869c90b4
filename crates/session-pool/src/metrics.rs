//! Pool metrics
//!
//! Recorded through the `metrics` facade; the hosting binary decides where
//! they go. Without an installed recorder every call is a no-op.
//!
//! - `imap_pool_sessions_opened_total` (counter): label `purpose`
//! - `imap_pool_sessions_closed_total` (counter): label `reason`
//! - `imap_pool_close_failures_total` (counter)
//! - `imap_pool_acquire_total` (counter): labels `purpose`, `outcome`
//! - `imap_pool_acquire_wait_seconds` (histogram): label `purpose`

use std::time::Duration;

use crate::registry::{CloseReason, Purpose};

pub const ACQUIRE_WAIT_SECONDS: &str = "imap_pool_acquire_wait_seconds";

pub(crate) fn record_opened(purpose: Purpose) {
    metrics::counter!("imap_pool_sessions_opened_total", "purpose" => purpose.label())
        .increment(1);
}

pub(crate) fn record_closed(reason: CloseReason) {
    metrics::counter!("imap_pool_sessions_closed_total", "reason" => reason.label())
        .increment(1);
}

pub(crate) fn record_close_failure() {
    metrics::counter!("imap_pool_close_failures_total").increment(1);
}

pub(crate) fn record_acquire(purpose: Purpose, outcome: &'static str, wait: Duration) {
    metrics::counter!(
        "imap_pool_acquire_total",
        "purpose" => purpose.label(),
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!(ACQUIRE_WAIT_SECONDS, "purpose" => purpose.label())
        .record(wait.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;

    #[test]
    fn counters_render_with_labels() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_opened(Purpose::Push);
        record_closed(CloseReason::IdleTimeout);
        record_close_failure();
        record_acquire(Purpose::Transient, "reused", Duration::from_millis(3));

        let output = handle.render();
        assert!(output.contains("imap_pool_sessions_opened_total{purpose=\"push\"} 1"));
        assert!(output.contains("reason=\"idle_timeout\""));
        assert!(output.contains("imap_pool_close_failures_total 1"));
        assert!(output.contains("outcome=\"reused\""));
        assert!(output.contains(ACQUIRE_WAIT_SECONDS));
    }
}
