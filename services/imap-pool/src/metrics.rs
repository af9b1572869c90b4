//! Prometheus metrics exposition
//!
//! The pool crate records its own counters and the acquire-wait histogram.
//! This module installs the recorder and adds the occupancy gauges, which
//! are refreshed from a pool snapshot on every scrape:
//!
//! - `imap_pool_slots` (gauge): label `state` (`idle`, `in_use`, `push`, `total`)
//! - `imap_pool_accounts` (gauge)

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use session_pool::PoolStats;
use session_pool::metrics::ACQUIRE_WAIT_SECONDS;

/// Wait buckets from 1ms up to well past any sane `wait_timeout`.
const WAIT_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(ACQUIRE_WAIT_SECONDS.to_string()), WAIT_BUCKETS)
}

/// Install the global Prometheus recorder and return a handle for `/metrics`.
///
/// Explicit buckets make the wait metric render as a histogram (`_bucket`
/// lines) instead of a summary.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    Ok(builder()?.install_recorder()?)
}

/// Refresh the occupancy gauges from `stats`.
pub fn publish_snapshot(stats: &PoolStats) {
    metrics::gauge!("imap_pool_slots", "state" => "total").set(stats.total_slots as f64);
    metrics::gauge!("imap_pool_slots", "state" => "idle").set(stats.idle() as f64);
    metrics::gauge!("imap_pool_slots", "state" => "in_use").set(stats.in_use() as f64);
    metrics::gauge!("imap_pool_slots", "state" => "push").set(stats.push() as f64);
    metrics::gauge!("imap_pool_accounts").set(stats.accounts_with_slots as f64);
}

#[cfg(test)]
pub(crate) fn isolated_recorder() -> (
    metrics_exporter_prometheus::PrometheusRecorder,
    PrometheusHandle,
) {
    let recorder = builder().unwrap().build_recorder();
    let handle = recorder.handle();
    (recorder, handle)
}
