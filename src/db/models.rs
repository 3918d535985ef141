//! Database model types.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reserved group that absorbs endpoints without an explicit assignment.
pub const DEFAULT_GROUP_ID: i64 = 1;

/// An endpoint group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
}

/// A network endpoint to probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub group_id: i64,
}

/// Classification of a single probe attempt, also stored as `last_ping_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PingStatus {
    Success,
    Timeout,
    PermissionDenied,
    ProbeError,
}

impl PingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PingStatus::Success => "success",
            PingStatus::Timeout => "timeout",
            PingStatus::PermissionDenied => "permission_denied",
            PingStatus::ProbeError => "probe_error",
        }
    }
}

impl fmt::Display for PingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
#[error("unknown ping status: {0}")]
pub struct UnknownStatus(String);

impl FromStr for PingStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(PingStatus::Success),
            "timeout" => Ok(PingStatus::Timeout),
            "permission_denied" => Ok(PingStatus::PermissionDenied),
            "probe_error" => Ok(PingStatus::ProbeError),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl ToSql for PingStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for PingStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// The result of one probe attempt against one endpoint.
///
/// Persisted as one `raw_events` row keyed by `(timestamp, endpoint_id)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeOutcome {
    pub endpoint_id: i64,
    /// Probe initiation time
    pub timestamp: DateTime<Utc>,
    pub status: PingStatus,
    /// Round-trip latency in milliseconds, success only
    pub latency_ms: Option<f64>,
    /// Address the echo reply came from, success only
    pub reply_addr: Option<IpAddr>,
    pub ttl: Option<u8>,
    pub payload_bytes: usize,
}

impl ProbeOutcome {
    pub fn success(
        endpoint_id: i64,
        timestamp: DateTime<Utc>,
        latency_ms: f64,
        reply_addr: IpAddr,
        ttl: Option<u8>,
        payload_bytes: usize,
    ) -> Self {
        Self {
            endpoint_id,
            timestamp,
            status: PingStatus::Success,
            latency_ms: Some(latency_ms),
            reply_addr: Some(reply_addr),
            ttl,
            payload_bytes,
        }
    }

    pub fn failure(
        endpoint_id: i64,
        timestamp: DateTime<Utc>,
        status: PingStatus,
        payload_bytes: usize,
    ) -> Self {
        Self {
            endpoint_id,
            timestamp,
            status,
            latency_ms: None,
            reply_addr: None,
            ttl: None,
            payload_bytes,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == PingStatus::Success
    }
}

/// Incrementally maintained per-endpoint summary row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointCurrentStats {
    pub endpoint_id: i64,
    pub success_count: i64,
    pub failed_count: i64,
    pub total_sent: i64,
    /// failed_count / total_sent * 100
    pub failed_pct: f64,
    pub consecutive_failed_count: i64,
    pub max_consecutive_failed_count: i64,
    pub max_consecutive_failed_time: Option<DateTime<Utc>>,
    pub last_ping_status: PingStatus,
    pub last_ping_latency: Option<f64>,
    /// Mean latency over successful probes only
    pub average_latency: Option<f64>,
    pub last_success_on: Option<DateTime<Utc>>,
    pub last_failed_on: Option<DateTime<Utc>>,
    pub last_reply_addr: Option<IpAddr>,
}

/// Rollup bucket width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Granularity {
    #[serde(rename = "1m")]
    Minute,
    #[serde(rename = "1h")]
    Hour,
}

impl Granularity {
    pub fn window_seconds(&self) -> i64 {
        match self {
            Granularity::Minute => 60,
            Granularity::Hour => 3600,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Minute => "1m",
            Granularity::Hour => "1h",
        }
    }
}

/// A fixed-width summary of raw events for one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollupBucket {
    pub endpoint_id: i64,
    pub granularity: Granularity,
    pub bucket_start: DateTime<Utc>,
    pub sent_count: i64,
    pub fail_count: i64,
    /// fail_count / sent_count * 100
    pub loss_rate: f64,
    /// Successes only; absent when the bucket has none
    pub avg_latency: Option<f64>,
    pub max_latency: Option<f64>,
}

impl RollupBucket {
    pub fn success_count(&self) -> i64 {
        self.sent_count - self.fail_count
    }
}

/// Storage statistics for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    pub db_size_bytes: i64,
    pub raw_events: i64,
    pub minute_buckets: i64,
    pub hour_buckets: i64,
    pub tracked_endpoints: i64,
}

/// Convert a timestamp to the integer microseconds used as storage keys.
pub fn to_micros(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_micros()
}

/// Inverse of [`to_micros`].
pub fn from_micros(us: i64) -> Option<DateTime<Utc>> {
    let secs = us.div_euclid(1_000_000);
    let nanos = (us.rem_euclid(1_000_000) * 1_000) as u32;
    DateTime::from_timestamp(secs, nanos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_ping_status_round_trips_through_str() {
        for status in [
            PingStatus::Success,
            PingStatus::Timeout,
            PingStatus::PermissionDenied,
            PingStatus::ProbeError,
        ] {
            assert_eq!(status.as_str().parse::<PingStatus>().unwrap(), status);
        }
        assert!("lost".parse::<PingStatus>().is_err());
    }

    #[test]
    fn test_micros_conversion() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 56).unwrap()
            + chrono::Duration::microseconds(123_456);
        assert_eq!(from_micros(to_micros(dt)), Some(dt));

        let before_epoch = Utc.with_ymd_and_hms(1969, 12, 31, 23, 59, 59).unwrap()
            + chrono::Duration::microseconds(500_000);
        assert_eq!(from_micros(to_micros(before_epoch)), Some(before_epoch));
    }

    #[test]
    fn test_granularity_serializes_as_label() {
        assert_eq!(serde_json::to_string(&Granularity::Minute).unwrap(), "\"1m\"");
        assert_eq!(serde_json::to_string(&Granularity::Hour).unwrap(), "\"1h\"");
    }
}
