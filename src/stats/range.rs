//! Range statistics recomputed from rollup buckets.
//!
//! Streak fields need per-probe ordering, which buckets do not keep. They are
//! filled by a fixed rule: a window with failures and no success is one
//! unbroken streak of every probe sent in it; any success zeroes the streak.

use chrono::{DateTime, Duration, Utc};

use super::EndpointStats;
use crate::db::{Granularity, RollupBucket};

/// Longest window still answered from minute buckets.
pub const MINUTE_ROLLUP_MAX_SPAN_HOURS: i64 = 48;

/// Pick the bucket granularity for a query window.
pub fn select_granularity(start: DateTime<Utc>, end: DateTime<Utc>) -> Granularity {
    if end - start <= Duration::hours(MINUTE_ROLLUP_MAX_SPAN_HOURS) {
        Granularity::Minute
    } else {
        Granularity::Hour
    }
}

/// Aggregate one endpoint's buckets into range statistics.
pub fn reconcile(endpoint_id: i64, buckets: &[RollupBucket]) -> EndpointStats {
    let mut stats = EndpointStats::zero(endpoint_id);

    let mut weighted_latency = 0.0;
    let mut latency_weight = 0i64;

    for bucket in buckets {
        let successes = bucket.success_count();
        stats.total_sent += bucket.sent_count;
        stats.failed_count += bucket.fail_count;
        stats.success_count += successes;

        if let (Some(avg), true) = (bucket.avg_latency, successes > 0) {
            weighted_latency += avg * successes as f64;
            latency_weight += successes;
        }
        if successes > 0 {
            stats.last_success_on = stats.last_success_on.max(Some(bucket.bucket_start));
        }
        if bucket.fail_count > 0 {
            stats.last_failed_on = stats.last_failed_on.max(Some(bucket.bucket_start));
        }
    }

    if stats.total_sent > 0 {
        stats.failed_pct = stats.failed_count as f64 / stats.total_sent as f64 * 100.0;
    }
    if latency_weight > 0 {
        stats.average_latency = Some(weighted_latency / latency_weight as f64);
    }

    if stats.success_count == 0 && stats.failed_count > 0 {
        stats.consecutive_failed_count = stats.total_sent;
        stats.max_consecutive_failed_count = stats.total_sent;
        stats.max_consecutive_failed_time = stats.last_failed_on;
    }

    stats
}
