//! Retention manager for cleaning up old data.

use crate::db::{DbError, Granularity, Store};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const RETENTION_TICK: Duration = Duration::from_secs(60);

/// How long one tier of data is kept.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetentionPolicy {
    /// `None` for raw events
    pub granularity: Option<Granularity>,
    pub retention_days: i64,
    /// Age after which the tier is eligible for compaction
    pub compact_after_days: Option<i64>,
}

/// Fixed retention policies.
pub fn default_policies() -> Vec<RetentionPolicy> {
    vec![
        RetentionPolicy { granularity: None, retention_days: 30, compact_after_days: Some(7) },
        RetentionPolicy { granularity: Some(Granularity::Minute), retention_days: 365, compact_after_days: None },
        RetentionPolicy { granularity: Some(Granularity::Hour), retention_days: 730, compact_after_days: None },
    ]
}

/// Manager for deleting data past retention periods.
pub struct RetentionManager {
    store: Arc<Store>,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Start the retention manager background task.
    pub fn start(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let store = self.store.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RETENTION_TICK);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let store = store.clone();
                        let pass = tokio::task::spawn_blocking(move || process_retention(&store, Utc::now()));
                        if let Err(e) = pass.await {
                            tracing::error!("RetentionManager: pass panicked: {}", e);
                        }
                    }
                }
            }
            tracing::debug!("RetentionManager: stopped");
        })
    }
}

fn process_retention(store: &Store, now: DateTime<Utc>) {
    for policy in default_policies() {
        let tier = policy.granularity.map_or("raw", |g| g.as_str());
        match apply_policy(store, &policy, now) {
            Ok(0) => {}
            Ok(deleted) => tracing::debug!("RetentionManager: deleted {} {} rows", deleted, tier),
            Err(e) => tracing::error!("RetentionManager: failed to prune {}: {}", tier, e),
        }
    }
}

/// Delete everything in the policy's tier older than its horizon.
pub fn apply_policy(store: &Store, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<usize, DbError> {
    let cutoff = now - ChronoDuration::days(policy.retention_days);
    match policy.granularity {
        None => store.delete_raw_events_before(cutoff),
        Some(g) => store.delete_rollup_buckets_before(g, cutoff),
    }
}
