//! SQLite database store implementation.

use chrono::{DateTime, Utc};
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, Result as SqlResult, Row,
    TransactionBehavior,
};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

use super::models::*;
use crate::config::ProbeSettings;

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("database lock poisoned")]
    Poisoned,
    #[error("background task failed: {0}")]
    Background(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

const ENDPOINT_COLUMNS: &str = "id, name, address, group_id";

const CURRENT_STATS_COLUMNS: &str = "endpoint_id, success_count, failed_count, total_sent, \
     failed_pct, consecutive_failed_count, max_consecutive_failed_count, \
     max_consecutive_failed_time_us, last_ping_status, last_ping_latency, average_latency, \
     last_success_on_us, last_failed_on_us, last_reply_addr";

const ROLLUP_FROM_RAW: &str = "INSERT INTO rollup_buckets
        (endpoint_id, window_seconds, bucket_start_us, sent_count, fail_count, loss_rate, avg_latency, max_latency)
     SELECT endpoint_id, ?1, (ts_us / ?2) * ?2 AS bucket,
            COUNT(*),
            SUM(CASE WHEN success THEN 0 ELSE 1 END),
            100.0 * SUM(CASE WHEN success THEN 0 ELSE 1 END) / COUNT(*),
            AVG(CASE WHEN success THEN latency_ms END),
            MAX(CASE WHEN success THEN latency_ms END)
     FROM raw_events
     WHERE ts_us >= ?3 AND ts_us < ?4
     GROUP BY endpoint_id, bucket
     ON CONFLICT(endpoint_id, window_seconds, bucket_start_us) DO UPDATE SET
        sent_count=excluded.sent_count, fail_count=excluded.fail_count, loss_rate=excluded.loss_rate,
        avg_latency=excluded.avg_latency, max_latency=excluded.max_latency";

const ROLLUP_FROM_MINUTES: &str = "INSERT INTO rollup_buckets
        (endpoint_id, window_seconds, bucket_start_us, sent_count, fail_count, loss_rate, avg_latency, max_latency)
     SELECT endpoint_id, ?1, (bucket_start_us / ?2) * ?2 AS bucket,
            SUM(sent_count),
            SUM(fail_count),
            CASE WHEN SUM(sent_count) > 0 THEN 100.0 * SUM(fail_count) / SUM(sent_count) ELSE 0 END,
            SUM(avg_latency * (sent_count - fail_count))
                / NULLIF(SUM(CASE WHEN avg_latency IS NOT NULL THEN sent_count - fail_count ELSE 0 END), 0),
            MAX(max_latency)
     FROM rollup_buckets
     WHERE window_seconds = 60 AND bucket_start_us >= ?3 AND bucket_start_us < ?4
     GROUP BY endpoint_id, bucket
     ON CONFLICT(endpoint_id, window_seconds, bucket_start_us) DO UPDATE SET
        sent_count=excluded.sent_count, fail_count=excluded.fail_count, loss_rate=excluded.loss_rate,
        avg_latency=excluded.avg_latency, max_latency=excluded.max_latency";

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Run embedded migrations.
    fn init(&self) -> Result<(), DbError> {
        let mut conn = self.conn()?;
        embedded::migrations::runner()
            .run(&mut *conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Inventory ---

    /// Add a group and return it.
    pub fn add_group(&self, name: &str) -> Result<Group, DbError> {
        let conn = self.conn()?;
        conn.execute("INSERT INTO groups (name) VALUES (?1)", params![name])?;
        Ok(Group {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
        })
    }

    /// Add an endpoint. Without an explicit group it lands in the default group.
    pub fn add_endpoint(
        &self,
        name: &str,
        address: &str,
        group_id: Option<i64>,
    ) -> Result<Endpoint, DbError> {
        let group_id = group_id.unwrap_or(DEFAULT_GROUP_ID);
        let conn = self.conn()?;

        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM groups WHERE id = ?1)",
            params![group_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(DbError::NotFound(format!("group {}", group_id)));
        }

        conn.execute(
            "INSERT INTO endpoints (name, address, group_id) VALUES (?1, ?2, ?3)",
            params![name, address, group_id],
        )?;
        Ok(Endpoint {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            address: address.to_string(),
            group_id,
        })
    }

    /// Get all endpoints.
    pub fn list_endpoints(&self) -> Result<Vec<Endpoint>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM endpoints ORDER BY id",
            ENDPOINT_COLUMNS
        ))?;
        let endpoints = stmt
            .query_map([], row_to_endpoint)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(endpoints)
    }

    /// Get the endpoints belonging to any of the given groups.
    pub fn list_endpoints_in_groups(&self, group_ids: &[i64]) -> Result<Vec<Endpoint>, DbError> {
        if group_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM endpoints WHERE group_id IN ({}) ORDER BY id",
            ENDPOINT_COLUMNS,
            placeholders(group_ids.len())
        ))?;
        let endpoints = stmt
            .query_map(params_from_iter(group_ids.iter()), row_to_endpoint)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(endpoints)
    }

    // --- Probe outcomes ---

    /// Persist one probe outcome and fold it into the endpoint's summary row
    /// as a single transaction.
    ///
    /// The raw insert is idempotent on `(timestamp, endpoint_id)`: a duplicate
    /// leaves both tables untouched and returns `Ok(None)`. Otherwise `fold`
    /// receives the current summary (if any) and its result is written back.
    pub fn record_outcome<F>(
        &self,
        outcome: &ProbeOutcome,
        fold: F,
    ) -> Result<Option<EndpointCurrentStats>, DbError>
    where
        F: FnOnce(Option<EndpointCurrentStats>) -> EndpointCurrentStats,
    {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let error_kind = (!outcome.is_success()).then_some(outcome.status);
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO raw_events
                (ts_us, endpoint_id, success, latency_ms, reply_addr, ttl, error_kind, payload_bytes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                to_micros(outcome.timestamp),
                outcome.endpoint_id,
                outcome.is_success(),
                outcome.latency_ms,
                outcome.reply_addr.map(|a| a.to_string()),
                outcome.ttl,
                error_kind,
                outcome.payload_bytes as i64,
            ],
        )?;
        if inserted == 0 {
            return Ok(None);
        }

        let current = tx
            .query_row(
                &format!(
                    "SELECT {} FROM endpoint_current_stats WHERE endpoint_id = ?1",
                    CURRENT_STATS_COLUMNS
                ),
                params![outcome.endpoint_id],
                row_to_current_stats,
            )
            .optional()?;

        let next = fold(current);

        tx.execute(
            &format!(
                "INSERT INTO endpoint_current_stats ({})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                 ON CONFLICT(endpoint_id) DO UPDATE SET
                    success_count=excluded.success_count,
                    failed_count=excluded.failed_count,
                    total_sent=excluded.total_sent,
                    failed_pct=excluded.failed_pct,
                    consecutive_failed_count=excluded.consecutive_failed_count,
                    max_consecutive_failed_count=excluded.max_consecutive_failed_count,
                    max_consecutive_failed_time_us=excluded.max_consecutive_failed_time_us,
                    last_ping_status=excluded.last_ping_status,
                    last_ping_latency=excluded.last_ping_latency,
                    average_latency=excluded.average_latency,
                    last_success_on_us=excluded.last_success_on_us,
                    last_failed_on_us=excluded.last_failed_on_us,
                    last_reply_addr=excluded.last_reply_addr",
                CURRENT_STATS_COLUMNS
            ),
            params![
                next.endpoint_id,
                next.success_count,
                next.failed_count,
                next.total_sent,
                next.failed_pct,
                next.consecutive_failed_count,
                next.max_consecutive_failed_count,
                next.max_consecutive_failed_time.map(to_micros),
                next.last_ping_status,
                next.last_ping_latency,
                next.average_latency,
                next.last_success_on.map(to_micros),
                next.last_failed_on.map(to_micros),
                next.last_reply_addr.map(|a| a.to_string()),
            ],
        )?;

        tx.commit()?;
        Ok(Some(next))
    }

    /// Get summary rows for the given endpoints, or for every endpoint when
    /// `endpoint_ids` is empty.
    pub fn get_current_stats(&self, endpoint_ids: &[i64]) -> Result<Vec<EndpointCurrentStats>, DbError> {
        let conn = self.conn()?;
        let stats = if endpoint_ids.is_empty() {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM endpoint_current_stats ORDER BY endpoint_id",
                CURRENT_STATS_COLUMNS
            ))?;
            let rows = stmt
                .query_map([], row_to_current_stats)?
                .collect::<SqlResult<Vec<_>>>()?;
            rows
        } else {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM endpoint_current_stats WHERE endpoint_id IN ({}) ORDER BY endpoint_id",
                CURRENT_STATS_COLUMNS,
                placeholders(endpoint_ids.len())
            ))?;
            let rows = stmt
                .query_map(params_from_iter(endpoint_ids.iter()), row_to_current_stats)?
                .collect::<SqlResult<Vec<_>>>()?;
            rows
        };
        Ok(stats)
    }

    /// Count raw events for one endpoint.
    #[cfg(test)]
    pub fn count_raw_events(&self, endpoint_id: i64) -> Result<i64, DbError> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM raw_events WHERE endpoint_id = ?1",
            params![endpoint_id],
            |r| r.get(0),
        )?)
    }

    // --- Rollups ---

    /// Get the end of the last processed range for a granularity.
    pub fn get_rollup_watermark(&self, granularity: Granularity) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.conn()?;
        let us: Option<i64> = conn
            .query_row(
                "SELECT processed_until_us FROM rollup_progress WHERE window_seconds = ?1",
                params![granularity.window_seconds()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(us.and_then(from_micros))
    }

    /// Get the earliest time present in the source a granularity is built from:
    /// raw events for minute buckets, minute buckets for hour buckets.
    pub fn get_earliest_rollup_source(&self, granularity: Granularity) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.conn()?;
        let us: Option<i64> = match granularity {
            Granularity::Minute => {
                conn.query_row("SELECT MIN(ts_us) FROM raw_events", [], |row| row.get(0))?
            }
            Granularity::Hour => conn.query_row(
                "SELECT MIN(bucket_start_us) FROM rollup_buckets WHERE window_seconds = 60",
                [],
                |row| row.get(0),
            )?,
        };
        Ok(us.and_then(from_micros))
    }

    /// Recompute every bucket of `granularity` whose start lies in `[from, to)`
    /// and advance the watermark to `to`. Returns the number of buckets written.
    pub fn rollup_window(
        &self,
        granularity: Granularity,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<usize, DbError> {
        let window_us = granularity.window_seconds() * 1_000_000;
        let sql = match granularity {
            Granularity::Minute => ROLLUP_FROM_RAW,
            Granularity::Hour => ROLLUP_FROM_MINUTES,
        };

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let written = tx.execute(
            sql,
            params![
                granularity.window_seconds(),
                window_us,
                to_micros(from),
                to_micros(to)
            ],
        )?;
        tx.execute(
            "INSERT INTO rollup_progress (window_seconds, processed_until_us) VALUES (?1, ?2)
             ON CONFLICT(window_seconds) DO UPDATE SET processed_until_us=excluded.processed_until_us",
            params![granularity.window_seconds(), to_micros(to)],
        )?;
        tx.commit()?;
        Ok(written)
    }

    /// Get buckets for the given endpoints whose start lies in `[start, end)`,
    /// ordered by endpoint then time.
    pub fn get_rollup_buckets(
        &self,
        endpoint_ids: &[i64],
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RollupBucket>, DbError> {
        if endpoint_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT endpoint_id, bucket_start_us, sent_count, fail_count, loss_rate, avg_latency, max_latency
             FROM rollup_buckets
             WHERE window_seconds = ? AND bucket_start_us >= ? AND bucket_start_us < ?
               AND endpoint_id IN ({})
             ORDER BY endpoint_id, bucket_start_us",
            placeholders(endpoint_ids.len())
        ))?;

        let mut args = vec![granularity.window_seconds(), to_micros(start), to_micros(end)];
        args.extend_from_slice(endpoint_ids);

        let buckets = stmt
            .query_map(params_from_iter(args.iter()), |row| {
                Ok(RollupBucket {
                    endpoint_id: row.get(0)?,
                    granularity,
                    bucket_start: micros_col(1, row.get(1)?)?,
                    sent_count: row.get(2)?,
                    fail_count: row.get(3)?,
                    loss_rate: row.get(4)?,
                    avg_latency: row.get(5)?,
                    max_latency: row.get(6)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(buckets)
    }

    // --- Retention ---

    /// Delete raw events older than the cutoff.
    pub fn delete_raw_events_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        Ok(conn.execute(
            "DELETE FROM raw_events WHERE ts_us < ?1",
            params![to_micros(cutoff)],
        )?)
    }

    /// Delete buckets of one granularity older than the cutoff.
    pub fn delete_rollup_buckets_before(
        &self,
        granularity: Granularity,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, DbError> {
        let conn = self.conn()?;
        Ok(conn.execute(
            "DELETE FROM rollup_buckets WHERE window_seconds = ?1 AND bucket_start_us < ?2",
            params![granularity.window_seconds(), to_micros(cutoff)],
        )?)
    }

    // --- Settings ---

    /// Load persisted probe settings, if any were saved.
    pub fn load_settings(&self) -> Result<Option<ProbeSettings>, DbError> {
        let conn = self.conn()?;
        let body: Option<String> = conn
            .query_row("SELECT body FROM settings WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    /// Persist probe settings.
    pub fn save_settings(&self, settings: &ProbeSettings) -> Result<(), DbError> {
        let body = serde_json::to_string(settings)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO settings (id, body) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET body=excluded.body",
            params![body],
        )?;
        Ok(())
    }

    // --- Status ---

    /// Get database size and row counts.
    pub fn get_storage_stats(&self) -> Result<StorageStats, DbError> {
        let conn = self.conn()?;
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
        let raw_events: i64 = conn.query_row("SELECT COUNT(*) FROM raw_events", [], |r| r.get(0))?;
        let minute_buckets: i64 = conn.query_row(
            "SELECT COUNT(*) FROM rollup_buckets WHERE window_seconds = 60",
            [],
            |r| r.get(0),
        )?;
        let hour_buckets: i64 = conn.query_row(
            "SELECT COUNT(*) FROM rollup_buckets WHERE window_seconds = 3600",
            [],
            |r| r.get(0),
        )?;
        let tracked_endpoints: i64 =
            conn.query_row("SELECT COUNT(*) FROM endpoint_current_stats", [], |r| r.get(0))?;

        Ok(StorageStats {
            db_size_bytes: page_count * page_size,
            raw_events,
            minute_buckets,
            hour_buckets,
            tracked_endpoints,
        })
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn micros_col(idx: usize, us: i64) -> SqlResult<DateTime<Utc>> {
    from_micros(us).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, us))
}

fn opt_micros_col(row: &Row<'_>, idx: usize) -> SqlResult<Option<DateTime<Utc>>> {
    row.get::<_, Option<i64>>(idx)?
        .map(|us| micros_col(idx, us))
        .transpose()
}

fn row_to_endpoint(row: &Row<'_>) -> SqlResult<Endpoint> {
    Ok(Endpoint {
        id: row.get(0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        group_id: row.get(3)?,
    })
}

fn row_to_current_stats(row: &Row<'_>) -> SqlResult<EndpointCurrentStats> {
    Ok(EndpointCurrentStats {
        endpoint_id: row.get(0)?,
        success_count: row.get(1)?,
        failed_count: row.get(2)?,
        total_sent: row.get(3)?,
        failed_pct: row.get(4)?,
        consecutive_failed_count: row.get(5)?,
        max_consecutive_failed_count: row.get(6)?,
        max_consecutive_failed_time: opt_micros_col(row, 7)?,
        last_ping_status: row.get(8)?,
        last_ping_latency: row.get(9)?,
        average_latency: row.get(10)?,
        last_success_on: opt_micros_col(row, 11)?,
        last_failed_on: opt_micros_col(row, 12)?,
        last_reply_addr: row
            .get::<_, Option<String>>(13)?
            .and_then(|s| s.parse().ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::fold_outcome;
    use chrono::TimeZone;
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::NamedTempFile;

    fn open() -> (NamedTempFile, Store) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        (tmp, store)
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
    }

    fn ok(endpoint_id: i64, ts: DateTime<Utc>, latency: f64) -> ProbeOutcome {
        ProbeOutcome::success(
            endpoint_id,
            ts,
            latency,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            Some(64),
            56,
        )
    }

    fn lost(endpoint_id: i64, ts: DateTime<Utc>) -> ProbeOutcome {
        ProbeOutcome::failure(endpoint_id, ts, PingStatus::Timeout, 56)
    }

    fn record(store: &Store, outcome: &ProbeOutcome) -> Option<EndpointCurrentStats> {
        store
            .record_outcome(outcome, |prev| fold_outcome(prev, outcome))
            .unwrap()
    }

    #[test]
    fn test_endpoints_default_to_reserved_group() {
        let (_tmp, store) = open();
        let core = store.add_group("core").unwrap();

        let a = store.add_endpoint("a", "10.0.0.1", None).unwrap();
        let b = store.add_endpoint("b", "10.0.0.2", Some(core.id)).unwrap();
        assert_eq!(a.group_id, DEFAULT_GROUP_ID);
        assert_eq!(b.group_id, core.id);

        assert_eq!(store.list_endpoints().unwrap().len(), 2);
        assert_eq!(store.list_endpoints_in_groups(&[core.id]).unwrap(), vec![b.clone()]);
        assert_eq!(
            store.list_endpoints_in_groups(&[DEFAULT_GROUP_ID, core.id]).unwrap(),
            vec![a, b]
        );
        assert!(store.list_endpoints_in_groups(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_add_endpoint_unknown_group() {
        let (_tmp, store) = open();
        let err = store.add_endpoint("a", "10.0.0.1", Some(42)).unwrap_err();
        assert!(matches!(err, DbError::NotFound(_)));
    }

    #[test]
    fn test_record_outcome_is_idempotent_per_key() {
        let (_tmp, store) = open();
        let outcome = ok(1, at(12, 0, 0), 10.0);

        assert!(record(&store, &outcome).is_some());
        assert!(record(&store, &outcome).is_none());

        let stats = store.get_current_stats(&[1]).unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].success_count, 1);
        assert_eq!(stats[0].total_sent, 1);
        assert_eq!(store.count_raw_events(1).unwrap(), 1);
    }

    #[test]
    fn test_current_stats_round_trip() {
        let (_tmp, store) = open();
        let written = record(&store, &lost(7, at(12, 0, 0))).unwrap();
        let written = {
            let next = ok(7, at(12, 0, 1), 3.5);
            store
                .record_outcome(&next, |prev| {
                    assert_eq!(prev.as_ref(), Some(&written));
                    fold_outcome(prev, &next)
                })
                .unwrap()
                .unwrap()
        };

        let read = store.get_current_stats(&[]).unwrap();
        assert_eq!(read, vec![written]);
    }

    #[test]
    fn test_rollup_minute_and_hour() {
        let (_tmp, store) = open();
        record(&store, &ok(1, at(12, 0, 1), 10.0));
        record(&store, &ok(1, at(12, 0, 20), 30.0));
        record(&store, &lost(1, at(12, 0, 40)));
        record(&store, &ok(1, at(12, 1, 5), 50.0));
        record(&store, &lost(2, at(12, 1, 6)));

        let written = store
            .rollup_window(Granularity::Minute, at(12, 0, 0), at(12, 2, 0))
            .unwrap();
        assert_eq!(written, 3);
        assert_eq!(store.get_rollup_watermark(Granularity::Minute).unwrap(), Some(at(12, 2, 0)));

        let minutes = store
            .get_rollup_buckets(&[1], Granularity::Minute, at(12, 0, 0), at(13, 0, 0))
            .unwrap();
        assert_eq!(minutes.len(), 2);
        assert_eq!(minutes[0].bucket_start, at(12, 0, 0));
        assert_eq!(minutes[0].sent_count, 3);
        assert_eq!(minutes[0].fail_count, 1);
        assert!((minutes[0].loss_rate - 100.0 / 3.0).abs() < 1e-9);
        assert_eq!(minutes[0].avg_latency, Some(20.0));
        assert_eq!(minutes[0].max_latency, Some(30.0));

        let only_failures = store
            .get_rollup_buckets(&[2], Granularity::Minute, at(12, 0, 0), at(13, 0, 0))
            .unwrap();
        assert_eq!(only_failures[0].avg_latency, None);
        assert_eq!(only_failures[0].loss_rate, 100.0);

        store
            .rollup_window(Granularity::Hour, at(12, 0, 0), at(13, 0, 0))
            .unwrap();
        let hours = store
            .get_rollup_buckets(&[1, 2], Granularity::Hour, at(12, 0, 0), at(13, 0, 0))
            .unwrap();
        assert_eq!(hours.len(), 2);
        assert_eq!(hours[0].sent_count, 4);
        assert_eq!(hours[0].fail_count, 1);
        // (20 * 2 + 50 * 1) / 3
        assert_eq!(hours[0].avg_latency, Some(30.0));
        assert_eq!(hours[0].max_latency, Some(50.0));
        assert_eq!(hours[1].avg_latency, None);
    }

    #[test]
    fn test_rollup_recompute_is_idempotent() {
        let (_tmp, store) = open();
        record(&store, &ok(1, at(12, 0, 1), 10.0));
        store
            .rollup_window(Granularity::Minute, at(12, 0, 0), at(12, 1, 0))
            .unwrap();
        record(&store, &lost(1, at(12, 0, 59)));
        store
            .rollup_window(Granularity::Minute, at(12, 0, 0), at(12, 1, 0))
            .unwrap();

        let minutes = store
            .get_rollup_buckets(&[1], Granularity::Minute, at(12, 0, 0), at(12, 1, 0))
            .unwrap();
        assert_eq!(minutes.len(), 1);
        assert_eq!(minutes[0].sent_count, 2);
        assert_eq!(minutes[0].fail_count, 1);
    }

    #[test]
    fn test_retention_deletes() {
        let (_tmp, store) = open();
        record(&store, &ok(1, at(10, 0, 0), 1.0));
        record(&store, &ok(1, at(12, 0, 0), 1.0));
        store
            .rollup_window(Granularity::Minute, at(10, 0, 0), at(12, 1, 0))
            .unwrap();

        assert_eq!(store.delete_raw_events_before(at(11, 0, 0)).unwrap(), 1);
        assert_eq!(store.count_raw_events(1).unwrap(), 1);
        assert_eq!(
            store
                .delete_rollup_buckets_before(Granularity::Minute, at(11, 0, 0))
                .unwrap(),
            1
        );
        assert_eq!(store.get_storage_stats().unwrap().minute_buckets, 1);
    }

    #[test]
    fn test_settings_persistence() {
        let (_tmp, store) = open();
        assert_eq!(store.load_settings().unwrap(), None);

        let settings = ProbeSettings {
            ping_interval_sec: 9,
            ..Default::default()
        };
        store.save_settings(&settings).unwrap();
        assert_eq!(store.load_settings().unwrap(), Some(settings));
    }
}
