//! Folds probe outcomes into the raw event log and the per-endpoint summary.

use std::sync::Arc;

use crate::db::{DbError, EndpointCurrentStats, PingStatus, ProbeOutcome, Store};

/// Apply one outcome to an endpoint's summary row.
///
/// `prev` is `None` the first time an endpoint is probed.
pub fn fold_outcome(prev: Option<EndpointCurrentStats>, outcome: &ProbeOutcome) -> EndpointCurrentStats {
    let mut stats = prev.unwrap_or_else(|| empty_stats(outcome.endpoint_id));
    let ts = outcome.timestamp;

    stats.total_sent += 1;
    if outcome.is_success() {
        if let Some(latency) = outcome.latency_ms {
            let n = stats.success_count as f64;
            let old_avg = stats.average_latency.unwrap_or(0.0);
            stats.average_latency = Some((old_avg * n + latency) / (n + 1.0));
        }
        stats.success_count += 1;
        stats.consecutive_failed_count = 0;
        stats.last_ping_latency = outcome.latency_ms;
        stats.last_success_on = stats.last_success_on.max(Some(ts));
        if outcome.reply_addr.is_some() {
            stats.last_reply_addr = outcome.reply_addr;
        }
    } else {
        stats.failed_count += 1;
        stats.consecutive_failed_count += 1;
        if stats.consecutive_failed_count > stats.max_consecutive_failed_count {
            stats.max_consecutive_failed_count = stats.consecutive_failed_count;
            stats.max_consecutive_failed_time = Some(ts);
        }
        stats.last_ping_latency = None;
        stats.last_failed_on = stats.last_failed_on.max(Some(ts));
    }

    stats.last_ping_status = outcome.status;
    stats.failed_pct = stats.failed_count as f64 / stats.total_sent as f64 * 100.0;
    stats
}

fn empty_stats(endpoint_id: i64) -> EndpointCurrentStats {
    EndpointCurrentStats {
        endpoint_id,
        success_count: 0,
        failed_count: 0,
        total_sent: 0,
        failed_pct: 0.0,
        consecutive_failed_count: 0,
        max_consecutive_failed_count: 0,
        max_consecutive_failed_time: None,
        last_ping_status: PingStatus::ProbeError,
        last_ping_latency: None,
        average_latency: None,
        last_success_on: None,
        last_failed_on: None,
        last_reply_addr: None,
    }
}

/// Records outcomes as one atomic unit of work per probe.
///
/// Every write for an endpoint goes through [`Store::record_outcome`], whose
/// transaction makes the read-modify-write of the summary row atomic.
#[derive(Clone)]
pub struct StatsAggregator {
    store: Arc<Store>,
}

impl StatsAggregator {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Persist an outcome. Returns `false` when an outcome with the same
    /// `(timestamp, endpoint_id)` was already recorded.
    ///
    /// The write runs on the blocking pool and completes even if the calling
    /// future is dropped, so a started write is never left half applied.
    pub async fn record(&self, outcome: ProbeOutcome) -> Result<bool, DbError> {
        let store = self.store.clone();
        let written = tokio::task::spawn_blocking(move || {
            store.record_outcome(&outcome, |prev| fold_outcome(prev, &outcome))
        })
        .await
        .map_err(|e| DbError::Background(e.to_string()))??;
        Ok(written.is_some())
    }
}
