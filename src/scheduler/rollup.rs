//! Rollup manager folding raw events into minute and hour buckets.

use crate::db::{DbError, Granularity, Store};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const ROLLUP_TICK: Duration = Duration::from_secs(10);

/// Raw events younger than this may still be in flight to the store.
const SETTLE_SECONDS: i64 = 5;

/// Manager for rolling up raw data into time windows.
pub struct RollupManager {
    store: Arc<Store>,
}

impl RollupManager {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Start the rollup manager background task.
    pub fn start(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let store = self.store.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ROLLUP_TICK);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let store = store.clone();
                        let pass = tokio::task::spawn_blocking(move || process_rollups(&store, Utc::now()));
                        if let Err(e) = pass.await {
                            tracing::error!("RollupManager: pass panicked: {}", e);
                        }
                    }
                }
            }
            tracing::debug!("RollupManager: stopped");
        })
    }
}

/// Run one pass over both granularities. Minutes go first so the hour pass
/// sees them.
pub fn process_rollups(store: &Store, now: DateTime<Utc>) {
    for granularity in [Granularity::Minute, Granularity::Hour] {
        match process_granularity(store, granularity, now) {
            Ok(0) => {}
            Ok(written) => tracing::debug!(
                "RollupManager: wrote {} {} buckets",
                written,
                granularity.as_str()
            ),
            Err(e) => tracing::error!(
                "RollupManager: {} rollup failed: {}",
                granularity.as_str(),
                e
            ),
        }
    }
}

/// Recompute buckets from one window before the watermark up to the last
/// complete window. Returns the number of buckets written.
pub fn process_granularity(
    store: &Store,
    granularity: Granularity,
    now: DateTime<Utc>,
) -> Result<usize, DbError> {
    let window = granularity.window_seconds();
    let until = truncate_to_window(now - ChronoDuration::seconds(SETTLE_SECONDS), window);

    let from = match store.get_rollup_watermark(granularity)? {
        // One window back picks up probes persisted after the last pass
        Some(watermark) => watermark - ChronoDuration::seconds(window),
        None => match store.get_earliest_rollup_source(granularity)? {
            Some(earliest) => truncate_to_window(earliest, window),
            None => return Ok(0),
        },
    };

    if from >= until {
        return Ok(0);
    }
    store.rollup_window(granularity, from, until)
}

/// Truncate a datetime to the start of its containing window.
pub fn truncate_to_window(dt: DateTime<Utc>, window_seconds: i64) -> DateTime<Utc> {
    let ts = dt.timestamp();
    let truncated = ts - ts.rem_euclid(window_seconds);
    DateTime::from_timestamp(truncated, 0).unwrap_or(dt)
}
