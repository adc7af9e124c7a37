//! Measurement Store - SQLite-backed time-series tables
//!
//! One row per `(station, time)` in `measurements`, plus one materialized
//! rollup table per [`Granularity`]. Inserts are upserts so replaying a file
//! never duplicates rows.
//!
//! Reads and maintenance share a single guarded connection. Writers that
//! need a long transaction (one per source file) open their own connection
//! with [`MeasurementStore::connect`] and contend through SQLite locking,
//! which surfaces as [`StorageError::Busy`].

use crate::aggregation::{ThresholdBlock, TimeWindow};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{
    table_spec, AggregateBucket, Granularity, MeasurementRecord, RetentionPolicy,
    DATETIME_FORMAT,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS measurements (
        station TEXT NOT NULL,
        time TEXT NOT NULL,
        value REAL NOT NULL,
        source_file TEXT NOT NULL,
        datetime TEXT NOT NULL,
        raw_fields TEXT NOT NULL DEFAULT '{}',
        PRIMARY KEY (station, time)
    );
    CREATE INDEX IF NOT EXISTS idx_measurements_time ON measurements(time);

    CREATE TABLE IF NOT EXISTS thresholds (
        station TEXT NOT NULL,
        time_from TEXT NOT NULL,
        time_to TEXT NOT NULL,
        limit_value REAL NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_thresholds_station ON thresholds(station);

    CREATE TABLE IF NOT EXISTS retention_policies (
        table_name TEXT PRIMARY KEY,
        retention_days INTEGER NOT NULL,
        last_cleanup TEXT,
        enabled INTEGER NOT NULL DEFAULT 1
    );
";

/// SQLite-backed measurement store
pub struct MeasurementStore {
    path: PathBuf,
    busy_timeout: Duration,
    conn: Mutex<Connection>,
}

/// Row counts and file size
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub records: u64,
    pub stations: u64,
    pub size_bytes: u64,
}

impl MeasurementStore {
    /// Open or create the store at `path`
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        Self::with_busy_timeout(path, Duration::from_millis(250))
    }

    /// Open with a custom SQLite busy timeout
    pub fn with_busy_timeout(path: impl AsRef<Path>, busy_timeout: Duration) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Self::open_connection(&path, busy_timeout)?;
        // journal mode is persistent in the file, writer connections inherit it
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::trace!(journal_mode = %mode, "Journal mode set");
        conn.execute_batch(SCHEMA)?;
        for granularity in Granularity::all() {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    station TEXT NOT NULL,
                    bucket_start TEXT NOT NULL,
                    avg REAL NOT NULL,
                    min REAL NOT NULL,
                    max REAL NOT NULL,
                    count INTEGER NOT NULL,
                    alarm_count INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (station, bucket_start)
                );
                CREATE INDEX IF NOT EXISTS idx_{table}_start ON {table}(bucket_start);",
                table = granularity.table()
            ))?;
        }

        tracing::debug!(path = %path.display(), "Measurement store opened");

        Ok(Self {
            path,
            busy_timeout,
            conn: Mutex::new(conn),
        })
    }

    fn open_connection(path: &Path, busy_timeout: Duration) -> StorageResult<Connection> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(
            "
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            ",
        )?;

        Ok(conn)
    }

    /// Open a dedicated writer connection
    pub fn connect(&self) -> StorageResult<Connection> {
        Self::open_connection(&self.path, self.busy_timeout)
    }

    /// Path of the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StorageError::Lock(format!("Failed to acquire store lock: {}", e)))
    }

    // ==================== Measurements ====================

    /// Insert or replace a single record on an existing connection or transaction
    pub fn upsert(conn: &Connection, record: &MeasurementRecord) -> StorageResult<()> {
        let raw = serde_json::to_string(&record.raw_fields)?;
        let mut stmt = conn.prepare_cached(
            "INSERT INTO measurements (station, time, value, source_file, datetime, raw_fields)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(station, time) DO UPDATE SET
                value = excluded.value,
                source_file = excluded.source_file,
                datetime = excluded.datetime,
                raw_fields = excluded.raw_fields",
        )?;
        stmt.execute(params![
            record.station,
            record.time_key(),
            record.value,
            record.source_file,
            record.datetime(),
            raw,
        ])?;
        Ok(())
    }

    /// Upsert a batch inside one transaction
    pub fn upsert_batch(&self, records: &[MeasurementRecord]) -> StorageResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for record in records {
            Self::upsert(&tx, record)?;
        }
        tx.commit()?;
        Ok(records.len())
    }

    /// Number of stored measurements, optionally for one station
    pub fn count(&self, station: Option<&str>) -> StorageResult<u64> {
        let conn = self.lock()?;
        let count: i64 = match station {
            Some(station) => conn.query_row(
                "SELECT COUNT(*) FROM measurements WHERE station = ?1",
                params![station],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM measurements", [], |row| row.get(0))?,
        };
        Ok(count as u64)
    }

    /// All records of a station ordered by time
    pub fn records(&self, station: &str) -> StorageResult<Vec<MeasurementRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT station, time, value, source_file, raw_fields
             FROM measurements WHERE station = ?1 ORDER BY time",
        )?;
        let rows = stmt.query_map(params![station], record_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Records at or after `since`, ordered by station then time
    pub fn records_since(&self, since: NaiveDateTime) -> StorageResult<Vec<MeasurementRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT station, time, value, source_file, raw_fields
             FROM measurements WHERE time >= ?1 ORDER BY station, time",
        )?;
        let rows = stmt.query_map(params![format_time(since)], record_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Most recent record of a station
    pub fn latest(&self, station: &str) -> StorageResult<Option<MeasurementRecord>> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                "SELECT station, time, value, source_file, raw_fields
                 FROM measurements WHERE station = ?1 ORDER BY time DESC LIMIT 1",
                params![station],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Distinct stations with data
    pub fn stations(&self) -> StorageResult<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached("SELECT DISTINCT station FROM measurements ORDER BY station")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ==================== Rollups ====================

    /// Replace every bucket at or after `window_start` with `buckets`
    ///
    /// Runs in one transaction so readers never see a half-written window.
    pub fn replace_buckets(
        &self,
        granularity: Granularity,
        window_start: NaiveDateTime,
        buckets: &[AggregateBucket],
    ) -> StorageResult<usize> {
        let table = granularity.table();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            &format!("DELETE FROM {} WHERE bucket_start >= ?1", table),
            params![format_time(window_start)],
        )?;

        {
            let mut stmt = tx.prepare_cached(&format!(
                "INSERT INTO {} (station, bucket_start, avg, min, max, count, alarm_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(station, bucket_start) DO UPDATE SET
                    avg = excluded.avg,
                    min = excluded.min,
                    max = excluded.max,
                    count = excluded.count,
                    alarm_count = excluded.alarm_count",
                table
            ))?;

            for bucket in buckets {
                stmt.execute(params![
                    bucket.station,
                    format_time(bucket.bucket_start),
                    bucket.avg,
                    bucket.min,
                    bucket.max,
                    bucket.count as i64,
                    bucket.alarm_count as i64,
                ])?;
            }
        }

        tx.commit()?;
        Ok(buckets.len())
    }

    /// Stored buckets of one station, optionally from `since` on
    pub fn buckets(
        &self,
        granularity: Granularity,
        station: &str,
        since: Option<NaiveDateTime>,
    ) -> StorageResult<Vec<AggregateBucket>> {
        let conn = self.lock()?;
        let since = since.map(format_time).unwrap_or_default();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT station, bucket_start, avg, min, max, count, alarm_count
             FROM {} WHERE station = ?1 AND bucket_start >= ?2 ORDER BY bucket_start",
            granularity.table()
        ))?;
        let rows = stmt.query_map(params![station, since], |row| {
            Ok(AggregateBucket {
                station: row.get(0)?,
                bucket_start: time_column(row, 1)?,
                granularity,
                avg: row.get(2)?,
                min: row.get(3)?,
                max: row.get(4)?,
                count: row.get::<_, i64>(5)? as u64,
                alarm_count: row.get::<_, i64>(6)? as u64,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ==================== Thresholds ====================

    /// All threshold blocks, ordered by station
    pub fn thresholds(&self) -> StorageResult<Vec<ThresholdBlock>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT station, time_from, time_to, limit_value FROM thresholds ORDER BY station, time_from",
        )?;
        let rows = stmt.query_map([], |row| {
            let station: String = row.get(0)?;
            let from: String = row.get(1)?;
            let to: String = row.get(2)?;
            let limit: f64 = row.get(3)?;
            Ok((station, from, to, limit))
        })?;

        let mut blocks = Vec::new();
        for row in rows {
            let (station, from, to, limit) = row?;
            match TimeWindow::parse(&from, &to) {
                Some(window) => blocks.push(ThresholdBlock::new(station, window, limit)),
                None => tracing::warn!(
                    station = %station,
                    from = %from,
                    to = %to,
                    "Ignoring threshold block with unparsable window"
                ),
            }
        }
        Ok(blocks)
    }

    /// Replace the threshold blocks of one station
    pub fn set_thresholds(&self, station: &str, blocks: &[ThresholdBlock]) -> StorageResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM thresholds WHERE station = ?1", params![station])?;
        for block in blocks {
            tx.execute(
                "INSERT INTO thresholds (station, time_from, time_to, limit_value) VALUES (?1, ?2, ?3, ?4)",
                params![
                    station,
                    block.window.from.format("%H:%M:%S").to_string(),
                    block.window.to.format("%H:%M:%S").to_string(),
                    block.limit,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // ==================== Retention ====================

    /// Insert policies for tables that have none yet
    pub fn seed_retention_policies(&self, policies: &[RetentionPolicy]) -> StorageResult<()> {
        let conn = self.lock()?;
        for policy in policies {
            conn.execute(
                "INSERT OR IGNORE INTO retention_policies (table_name, retention_days, last_cleanup, enabled)
                 VALUES (?1, ?2, NULL, ?3)",
                params![policy.table, policy.retention_days, policy.enabled],
            )?;
        }
        Ok(())
    }

    /// Insert or replace a policy
    pub fn save_retention_policy(&self, policy: &RetentionPolicy) -> StorageResult<()> {
        if table_spec(&policy.table).is_none() {
            return Err(StorageError::UnknownTable(policy.table.clone()));
        }
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO retention_policies (table_name, retention_days, last_cleanup, enabled)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                policy.table,
                policy.retention_days,
                policy.last_cleanup.map(|t| t.to_rfc3339()),
                policy.enabled,
            ],
        )?;
        Ok(())
    }

    /// All configured policies
    pub fn retention_policies(&self) -> StorageResult<Vec<RetentionPolicy>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT table_name, retention_days, last_cleanup, enabled FROM retention_policies ORDER BY table_name",
        )?;
        let rows = stmt.query_map([], |row| {
            let last_cleanup: Option<String> = row.get(2)?;
            Ok(RetentionPolicy {
                table: row.get(0)?,
                retention_days: row.get(1)?,
                last_cleanup: last_cleanup
                    .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                    .map(|t| t.with_timezone(&Utc)),
                enabled: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Record a completed cleanup
    pub fn mark_cleanup(&self, table: &str, at: DateTime<Utc>) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE retention_policies SET last_cleanup = ?1 WHERE table_name = ?2",
            params![at.to_rfc3339(), table],
        )?;
        Ok(())
    }

    /// Delete rows of a managed table older than `cutoff`
    pub fn delete_older_than(&self, table: &str, cutoff: NaiveDateTime) -> StorageResult<usize> {
        let spec = table_spec(table).ok_or_else(|| StorageError::UnknownTable(table.to_string()))?;
        let conn = self.lock()?;
        let deleted = conn.execute(
            &format!("DELETE FROM {} WHERE {} < ?1", spec.name, spec.time_column),
            params![format_time(cutoff)],
        )?;
        Ok(deleted)
    }

    // ==================== Maintenance ====================

    /// Reclaim free pages after large deletions
    pub fn compact(&self) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE); VACUUM;")?;
        Ok(())
    }

    /// Refresh query-planner statistics
    pub fn analyze(&self) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute_batch("ANALYZE;")?;
        Ok(())
    }

    /// Row counts and database size
    pub fn stats(&self) -> StorageResult<StoreStats> {
        let (records, stations) = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT COUNT(*), COUNT(DISTINCT station) FROM measurements",
                [],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )?
        };
        let size_bytes = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);

        Ok(StoreStats {
            records: records as u64,
            stations: stations as u64,
            size_bytes,
        })
    }
}

fn format_time(time: NaiveDateTime) -> String {
    time.format(DATETIME_FORMAT).to_string()
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDateTime> {
    let text: String = row.get(idx)?;
    NaiveDateTime::parse_from_str(&text, DATETIME_FORMAT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<MeasurementRecord> {
    let raw: String = row.get(4)?;
    Ok(MeasurementRecord {
        station: row.get(0)?,
        time: time_column(row, 1)?,
        value: row.get(2)?,
        source_file: row.get(3)?,
        raw_fields: serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};
    use tempfile::tempdir;

    fn create_test_store() -> (MeasurementStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = MeasurementStore::open(dir.path().join("test.db")).unwrap();
        (store, dir)
    }

    fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, day)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn test_upsert_replaces_on_same_key() {
        let (store, _dir) = create_test_store();

        store
            .upsert_batch(&[MeasurementRecord::new("ort", at(1, 10, 0), 50.0).source_file("a.csv")])
            .unwrap();
        store
            .upsert_batch(&[MeasurementRecord::new("ort", at(1, 10, 0), 61.5).source_file("b.csv")])
            .unwrap();

        let records = store.records("ort").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, 61.5);
        assert_eq!(records[0].source_file, "b.csv");
        assert_eq!(store.count(None).unwrap(), 1);
    }

    #[test]
    fn test_records_since_and_latest() {
        let (store, _dir) = create_test_store();
        store
            .upsert_batch(&[
                MeasurementRecord::new("b", at(1, 9, 0), 40.0),
                MeasurementRecord::new("a", at(1, 11, 0), 42.0),
                MeasurementRecord::new("a", at(1, 8, 0), 41.0),
            ])
            .unwrap();

        let since = store.records_since(at(1, 8, 30)).unwrap();
        assert_eq!(since.len(), 2);
        assert_eq!(since[0].station, "a");
        assert_eq!(since[1].station, "b");

        let latest = store.latest("a").unwrap().unwrap();
        assert_eq!(latest.time, at(1, 11, 0));
        assert!(store.latest("missing").unwrap().is_none());
        assert_eq!(store.stations().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_replace_buckets_rewrites_window() {
        let (store, _dir) = create_test_store();
        let bucket = |start, avg| AggregateBucket {
            station: "ort".to_string(),
            bucket_start: start,
            granularity: Granularity::Hourly,
            avg,
            min: avg,
            max: avg,
            count: 1,
            alarm_count: 0,
        };

        store
            .replace_buckets(
                Granularity::Hourly,
                at(1, 0, 0),
                &[bucket(at(1, 8, 0), 1.0), bucket(at(1, 9, 0), 2.0)],
            )
            .unwrap();
        // Second pass only covers 09:00 onwards, 08:00 must survive
        store
            .replace_buckets(Granularity::Hourly, at(1, 9, 0), &[bucket(at(1, 10, 0), 3.0)])
            .unwrap();

        let buckets = store.buckets(Granularity::Hourly, "ort", None).unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].bucket_start, at(1, 8, 0));
        assert_eq!(buckets[1].avg, 3.0);
    }

    #[test]
    fn test_retention_delete_and_unknown_table() {
        let (store, _dir) = create_test_store();
        store
            .upsert_batch(&[
                MeasurementRecord::new("ort", at(1, 10, 0), 50.0),
                MeasurementRecord::new("ort", at(20, 10, 0), 50.0),
            ])
            .unwrap();

        let deleted = store.delete_older_than("measurements", at(10, 0, 0)).unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.count(Some("ort")).unwrap(), 1);

        let err = store.delete_older_than("thresholds", at(10, 0, 0)).unwrap_err();
        assert!(matches!(err, StorageError::UnknownTable(_)));
    }

    #[test]
    fn test_retention_policy_roundtrip() {
        let (store, _dir) = create_test_store();
        store
            .seed_retention_policies(&crate::storage::types::default_retention_policies())
            .unwrap();

        // Seeding again must not overwrite an edited policy
        store
            .save_retention_policy(&RetentionPolicy::new("measurements", 30))
            .unwrap();
        store
            .seed_retention_policies(&crate::storage::types::default_retention_policies())
            .unwrap();

        let policies = store.retention_policies().unwrap();
        assert_eq!(policies.len(), 4);
        let raw = policies.iter().find(|p| p.table == "measurements").unwrap();
        assert_eq!(raw.retention_days, 30);

        store.mark_cleanup("measurements", Utc::now()).unwrap();
        let policies = store.retention_policies().unwrap();
        let raw = policies.iter().find(|p| p.table == "measurements").unwrap();
        assert!(raw.last_cleanup.is_some());
    }

    #[test]
    fn test_thresholds_roundtrip() {
        let (store, _dir) = create_test_store();
        let window = TimeWindow::new(
            NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
        );
        store
            .set_thresholds("ort", &[ThresholdBlock::new("ort", window, 45.0)])
            .unwrap();

        let blocks = store.thresholds().unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].window, window);
        assert_eq!(blocks[0].limit, 45.0);
    }

    #[test]
    fn test_thresholds_keep_seconds() {
        let (store, _dir) = create_test_store();
        let window = TimeWindow::parse("22:00:30", "05:59:59").unwrap();
        store
            .set_thresholds("ort", &[ThresholdBlock::new("ort", window, 45.0)])
            .unwrap();

        let blocks = store.thresholds().unwrap();
        assert_eq!(blocks[0].window, window);
        assert_eq!(blocks[0].window.from, NaiveTime::from_hms_opt(22, 0, 30).unwrap());
    }

    #[test]
    fn test_maintenance_and_stats() {
        let (store, _dir) = create_test_store();
        store
            .upsert_batch(&[MeasurementRecord::new("ort", at(1, 10, 0), 50.0)])
            .unwrap();
        store.analyze().unwrap();
        store.compact().unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.records, 1);
        assert_eq!(stats.stations, 1);
        assert!(stats.size_bytes > 0);
    }

    #[test]
    fn test_writer_connection_sees_committed_rows() {
        let (store, _dir) = create_test_store();
        let mut conn = store.connect().unwrap();
        let tx = conn.transaction().unwrap();
        MeasurementStore::upsert(&tx, &MeasurementRecord::new("ort", at(2, 1, 0), 33.0)).unwrap();
        tx.commit().unwrap();

        assert_eq!(store.count(Some("ort")).unwrap(), 1);
    }
}
