//! Endpoint statistics: the write-side aggregator and the live/range queries.

mod aggregator;
mod range;

#[cfg(test)]
pub use aggregator::fold_outcome;
pub use aggregator::StatsAggregator;
pub use range::{reconcile, select_granularity};

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::db::{DbError, EndpointCurrentStats, Granularity, PingStatus, RollupBucket, Store};
use crate::scheduler::truncate_to_window;

/// Query error types.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("store error: {0}")]
    Store(#[from] DbError),
}

/// One endpoint's statistics as returned by both live and range queries.
///
/// Range rows leave the live-only fields (`last_ping_status`,
/// `last_ping_latency`, `last_reply_addr`) empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointStats {
    pub endpoint_id: i64,
    pub success_count: i64,
    pub failed_count: i64,
    pub total_sent: i64,
    pub failed_pct: f64,
    pub average_latency: Option<f64>,
    pub last_success_on: Option<DateTime<Utc>>,
    pub last_failed_on: Option<DateTime<Utc>>,
    pub consecutive_failed_count: i64,
    pub max_consecutive_failed_count: i64,
    pub max_consecutive_failed_time: Option<DateTime<Utc>>,
    pub last_ping_status: Option<PingStatus>,
    pub last_ping_latency: Option<f64>,
    pub last_reply_addr: Option<IpAddr>,
}

impl EndpointStats {
    /// An endpoint that has not been probed.
    pub fn zero(endpoint_id: i64) -> Self {
        Self {
            endpoint_id,
            success_count: 0,
            failed_count: 0,
            total_sent: 0,
            failed_pct: 0.0,
            average_latency: None,
            last_success_on: None,
            last_failed_on: None,
            consecutive_failed_count: 0,
            max_consecutive_failed_count: 0,
            max_consecutive_failed_time: None,
            last_ping_status: None,
            last_ping_latency: None,
            last_reply_addr: None,
        }
    }
}

impl From<EndpointCurrentStats> for EndpointStats {
    fn from(s: EndpointCurrentStats) -> Self {
        Self {
            endpoint_id: s.endpoint_id,
            success_count: s.success_count,
            failed_count: s.failed_count,
            total_sent: s.total_sent,
            failed_pct: s.failed_pct,
            average_latency: s.average_latency,
            last_success_on: s.last_success_on,
            last_failed_on: s.last_failed_on,
            consecutive_failed_count: s.consecutive_failed_count,
            max_consecutive_failed_count: s.max_consecutive_failed_count,
            max_consecutive_failed_time: s.max_consecutive_failed_time,
            last_ping_status: Some(s.last_ping_status),
            last_ping_latency: s.last_ping_latency,
            last_reply_addr: s.last_reply_addr,
        }
    }
}

// ============================================================================
// Sorting
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    EndpointId,
    SuccessCount,
    FailedCount,
    FailedPct,
    TotalSent,
    AverageLatency,
    LastSuccessOn,
    LastFailedOn,
    LastPingLatency,
    ConsecutiveFailedCount,
    MaxConsecutiveFailedCount,
    MaxConsecutiveFailedTime,
}

impl SortField {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortField::EndpointId => "endpoint_id",
            SortField::SuccessCount => "success_count",
            SortField::FailedCount => "failed_count",
            SortField::FailedPct => "failed_pct",
            SortField::TotalSent => "total_sent",
            SortField::AverageLatency => "average_latency",
            SortField::LastSuccessOn => "last_success_on",
            SortField::LastFailedOn => "last_failed_on",
            SortField::LastPingLatency => "last_ping_latency",
            SortField::ConsecutiveFailedCount => "consecutive_failed_count",
            SortField::MaxConsecutiveFailedCount => "max_consecutive_failed_count",
            SortField::MaxConsecutiveFailedTime => "max_consecutive_failed_time",
        }
    }

    /// Whether the field can be derived from rollup buckets.
    pub fn is_range_sortable(&self) -> bool {
        !matches!(
            self,
            SortField::LastPingLatency
                | SortField::ConsecutiveFailedCount
                | SortField::MaxConsecutiveFailedCount
                | SortField::MaxConsecutiveFailedTime
        )
    }

    // Integers and microsecond timestamps stay exact well below 2^53.
    fn key(&self, s: &EndpointStats) -> Option<f64> {
        match self {
            SortField::EndpointId => Some(s.endpoint_id as f64),
            SortField::SuccessCount => Some(s.success_count as f64),
            SortField::FailedCount => Some(s.failed_count as f64),
            SortField::FailedPct => Some(s.failed_pct),
            SortField::TotalSent => Some(s.total_sent as f64),
            SortField::AverageLatency => s.average_latency,
            SortField::LastSuccessOn => s.last_success_on.map(|t| t.timestamp_micros() as f64),
            SortField::LastFailedOn => s.last_failed_on.map(|t| t.timestamp_micros() as f64),
            SortField::LastPingLatency => s.last_ping_latency,
            SortField::ConsecutiveFailedCount => Some(s.consecutive_failed_count as f64),
            SortField::MaxConsecutiveFailedCount => Some(s.max_consecutive_failed_count as f64),
            SortField::MaxConsecutiveFailedTime => {
                s.max_consecutive_failed_time.map(|t| t.timestamp_micros() as f64)
            }
        }
    }
}

impl fmt::Display for SortField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortField {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let field = match s {
            "endpoint_id" => SortField::EndpointId,
            "success_count" => SortField::SuccessCount,
            "failed_count" => SortField::FailedCount,
            "failed_pct" => SortField::FailedPct,
            "total_sent" => SortField::TotalSent,
            "average_latency" => SortField::AverageLatency,
            "last_success_on" => SortField::LastSuccessOn,
            "last_failed_on" => SortField::LastFailedOn,
            "last_ping_latency" => SortField::LastPingLatency,
            "consecutive_failed_count" => SortField::ConsecutiveFailedCount,
            "max_consecutive_failed_count" => SortField::MaxConsecutiveFailedCount,
            "max_consecutive_failed_time" => SortField::MaxConsecutiveFailedTime,
            other => {
                return Err(QueryError::InvalidArgument(format!("unknown sort field: {}", other)))
            }
        };
        Ok(field)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl FromStr for SortOrder {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(QueryError::InvalidArgument(format!("unknown sort order: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sort {
    pub field: SortField,
    pub order: SortOrder,
}

impl Sort {
    /// Parse a sort request; `order` defaults to ascending.
    pub fn parse(field: &str, order: Option<&str>) -> Result<Self, QueryError> {
        Ok(Self {
            field: field.parse()?,
            order: order.map(str::parse).transpose()?.unwrap_or_default(),
        })
    }
}

/// Sort rows in place. Absent values go last in either order and ties break
/// by endpoint id.
pub fn sort_stats(rows: &mut [EndpointStats], sort: Sort) {
    rows.sort_by(|a, b| {
        let ord = match (sort.field.key(a), sort.field.key(b)) {
            (Some(x), Some(y)) => match sort.order {
                SortOrder::Asc => x.total_cmp(&y),
                SortOrder::Desc => y.total_cmp(&x),
            },
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        };
        ord.then(a.endpoint_id.cmp(&b.endpoint_id))
    });
}

// ============================================================================
// Queries
// ============================================================================

/// Result of a range query.
#[derive(Debug, Clone, Serialize)]
pub struct RangeReport {
    pub granularity: Granularity,
    pub stats: Vec<EndpointStats>,
}

/// Read-side statistics queries.
#[derive(Clone)]
pub struct StatsService {
    store: Arc<Store>,
}

impl StatsService {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Statistics straight from the incrementally maintained summary rows.
    ///
    /// An empty `endpoint_ids` returns every endpoint that has been probed;
    /// requested endpoints without a summary row come back zero-valued.
    pub fn live(&self, endpoint_ids: &[i64], sort: Option<Sort>) -> Result<Vec<EndpointStats>, QueryError> {
        let ids = dedup(endpoint_ids);
        let current = self.store.get_current_stats(&ids)?;

        let mut rows: Vec<EndpointStats> = if ids.is_empty() {
            current.into_iter().map(EndpointStats::from).collect()
        } else {
            let mut by_id: HashMap<i64, EndpointCurrentStats> =
                current.into_iter().map(|s| (s.endpoint_id, s)).collect();
            ids.iter()
                .map(|id| by_id.remove(id).map_or_else(|| EndpointStats::zero(*id), EndpointStats::from))
                .collect()
        };

        sort_stats(&mut rows, sort.unwrap_or(Sort { field: SortField::EndpointId, order: SortOrder::Asc }));
        Ok(rows)
    }

    /// Statistics recomputed from rollup buckets over `[start, end)`.
    ///
    /// Buckets are selected by their start time; the bucket containing
    /// `start` is included. An empty `endpoint_ids` covers every endpoint in
    /// the inventory.
    pub fn range(
        &self,
        endpoint_ids: &[i64],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        sort: Option<Sort>,
    ) -> Result<RangeReport, QueryError> {
        if start >= end {
            return Err(QueryError::InvalidArgument(format!(
                "start ({}) must be before end ({})",
                start.to_rfc3339(),
                end.to_rfc3339()
            )));
        }
        if let Some(sort) = sort {
            if !sort.field.is_range_sortable() {
                return Err(QueryError::InvalidArgument(format!(
                    "{} cannot be sorted in range mode",
                    sort.field
                )));
            }
        }

        let ids = if endpoint_ids.is_empty() {
            self.store.list_endpoints()?.into_iter().map(|e| e.id).collect()
        } else {
            dedup(endpoint_ids)
        };

        let granularity = select_granularity(start, end);
        let from = truncate_to_window(start, granularity.window_seconds());
        let buckets = self.store.get_rollup_buckets(&ids, granularity, from, end)?;

        let mut by_id: HashMap<i64, Vec<RollupBucket>> = HashMap::new();
        for bucket in buckets {
            by_id.entry(bucket.endpoint_id).or_default().push(bucket);
        }

        let mut stats: Vec<EndpointStats> = ids
            .iter()
            .map(|id| reconcile(*id, by_id.get(id).map(Vec::as_slice).unwrap_or(&[])))
            .collect();
        sort_stats(&mut stats, sort.unwrap_or(Sort { field: SortField::EndpointId, order: SortOrder::Asc }));

        Ok(RangeReport { granularity, stats })
    }
}

fn dedup(ids: &[i64]) -> Vec<i64> {
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        if !out.contains(id) {
            out.push(*id);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ProbeOutcome;
    use chrono::{Duration, TimeZone};
    use std::net::Ipv4Addr;
    use tempfile::NamedTempFile;

    fn open() -> (NamedTempFile, Arc<Store>) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        (tmp, store)
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
    }

    fn record(store: &Store, outcome: ProbeOutcome) {
        store
            .record_outcome(&outcome, |prev| fold_outcome(prev, &outcome))
            .unwrap();
    }

    fn ok(endpoint_id: i64, ts: DateTime<Utc>, latency: f64) -> ProbeOutcome {
        ProbeOutcome::success(endpoint_id, ts, latency, IpAddr::V4(Ipv4Addr::LOCALHOST), None, 56)
    }

    fn lost(endpoint_id: i64, ts: DateTime<Utc>) -> ProbeOutcome {
        ProbeOutcome::failure(endpoint_id, ts, PingStatus::Timeout, 56)
    }

    fn row(endpoint_id: i64, failed_pct: f64, average_latency: Option<f64>) -> EndpointStats {
        EndpointStats {
            failed_pct,
            average_latency,
            ..EndpointStats::zero(endpoint_id)
        }
    }

    #[test]
    fn test_sort_parse() {
        let sort = Sort::parse("failed_pct", Some("desc")).unwrap();
        assert_eq!(sort.field, SortField::FailedPct);
        assert_eq!(sort.order, SortOrder::Desc);
        assert_eq!(Sort::parse("total_sent", None).unwrap().order, SortOrder::Asc);
        assert!(matches!(Sort::parse("ttl", None), Err(QueryError::InvalidArgument(_))));
        assert!(matches!(
            Sort::parse("total_sent", Some("sideways")),
            Err(QueryError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_range_sortable_is_strict_subset() {
        let all = [
            SortField::EndpointId,
            SortField::SuccessCount,
            SortField::FailedCount,
            SortField::FailedPct,
            SortField::TotalSent,
            SortField::AverageLatency,
            SortField::LastSuccessOn,
            SortField::LastFailedOn,
            SortField::LastPingLatency,
            SortField::ConsecutiveFailedCount,
            SortField::MaxConsecutiveFailedCount,
            SortField::MaxConsecutiveFailedTime,
        ];
        for field in all {
            assert_eq!(field.as_str().parse::<SortField>().unwrap(), field);
        }
        let range: Vec<_> = all.iter().filter(|f| f.is_range_sortable()).collect();
        assert_eq!(range.len(), 8);
        assert!(!SortField::ConsecutiveFailedCount.is_range_sortable());
        assert!(!SortField::MaxConsecutiveFailedTime.is_range_sortable());
    }

    #[test]
    fn test_sort_absent_last_and_ties_by_id() {
        let mut rows = vec![
            row(4, 10.0, None),
            row(3, 50.0, Some(2.0)),
            row(1, 10.0, Some(9.0)),
            row(2, 0.0, Some(5.0)),
        ];

        sort_stats(&mut rows, Sort::parse("failed_pct", Some("desc")).unwrap());
        let ids: Vec<_> = rows.iter().map(|r| r.endpoint_id).collect();
        assert_eq!(ids, vec![3, 1, 4, 2]);

        sort_stats(&mut rows, Sort::parse("average_latency", Some("asc")).unwrap());
        let ids: Vec<_> = rows.iter().map(|r| r.endpoint_id).collect();
        assert_eq!(ids, vec![3, 2, 1, 4]);

        sort_stats(&mut rows, Sort::parse("average_latency", Some("desc")).unwrap());
        let ids: Vec<_> = rows.iter().map(|r| r.endpoint_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_live_fills_missing_endpoints() {
        let (_tmp, store) = open();
        record(&store, ok(1, at(12, 0, 0), 4.0));
        record(&store, lost(2, at(12, 0, 0)));

        let service = StatsService::new(store);
        let rows = service.live(&[2, 9, 1, 2], None).unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.endpoint_id).collect();
        assert_eq!(ids, vec![1, 2, 9]);
        assert_eq!(rows[0].last_ping_status, Some(PingStatus::Success));
        assert_eq!(rows[1].consecutive_failed_count, 1);
        assert_eq!(rows[2], EndpointStats::zero(9));

        let all = service.live(&[], None).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_range_rejects_bad_window_and_sort() {
        let (_tmp, store) = open();
        let service = StatsService::new(store);

        let err = service.range(&[1], at(12, 0, 0), at(12, 0, 0), None).unwrap_err();
        assert!(matches!(err, QueryError::InvalidArgument(_)));

        let err = service.range(&[1], at(13, 0, 0), at(12, 0, 0), None).unwrap_err();
        assert!(matches!(err, QueryError::InvalidArgument(_)));

        let sort = Sort::parse("consecutive_failed_count", None).unwrap();
        let err = service
            .range(&[1], at(12, 0, 0), at(13, 0, 0), Some(sort))
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidArgument(_)));
    }

    #[test]
    fn test_range_over_minute_rollups() {
        let (_tmp, store) = open();
        for s in 0..5 {
            record(&store, lost(1, at(12, 0, s * 10)));
        }
        record(&store, ok(2, at(12, 0, 5), 10.0));
        record(&store, lost(2, at(12, 1, 5)));
        record(&store, ok(2, at(12, 2, 5), 30.0));
        store
            .rollup_window(Granularity::Minute, at(12, 0, 0), at(12, 3, 0))
            .unwrap();

        let service = StatsService::new(store);
        let sort = Sort::parse("failed_pct", Some("desc")).unwrap();
        let report = service
            .range(&[2, 1], at(12, 0, 30), at(12, 30, 0), Some(sort))
            .unwrap();
        assert_eq!(report.granularity, Granularity::Minute);

        let down = &report.stats[0];
        assert_eq!(down.endpoint_id, 1);
        assert_eq!(down.failed_count, 5);
        assert_eq!(down.consecutive_failed_count, 5);
        assert_eq!(down.max_consecutive_failed_count, 5);
        assert_eq!(down.max_consecutive_failed_time, Some(at(12, 0, 0)));
        assert_eq!(down.last_ping_status, None);

        let flappy = &report.stats[1];
        assert_eq!(flappy.total_sent, 3);
        assert_eq!(flappy.success_count, 2);
        assert_eq!(flappy.average_latency, Some(20.0));
        assert_eq!(flappy.last_success_on, Some(at(12, 2, 0)));
        assert_eq!(flappy.last_failed_on, Some(at(12, 1, 0)));
        assert_eq!(flappy.consecutive_failed_count, 0);
        assert_eq!(flappy.max_consecutive_failed_time, None);
    }

    #[test]
    fn test_long_range_uses_hour_rollups() {
        let (_tmp, store) = open();
        let endpoint = store.add_endpoint("a", "10.0.0.1", None).unwrap();
        record(&store, ok(endpoint.id, at(12, 0, 0), 5.0));
        store
            .rollup_window(Granularity::Minute, at(12, 0, 0), at(12, 1, 0))
            .unwrap();
        store
            .rollup_window(Granularity::Hour, at(12, 0, 0), at(13, 0, 0))
            .unwrap();

        let service = StatsService::new(store);
        let end = at(12, 0, 0) + Duration::hours(49);
        let report = service.range(&[], at(12, 0, 0), end, None).unwrap();
        assert_eq!(report.granularity, Granularity::Hour);
        assert_eq!(report.stats.len(), 1);
        assert_eq!(report.stats[0].success_count, 1);
    }
}
