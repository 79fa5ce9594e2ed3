//! SQLite position store: WAL-mode history table, latest projection, run history.
//!
//! Writes go through prepared, cached upsert statements. History rows are
//! written in bounded chunks, one transaction per chunk, so a failure late in a
//! large batch keeps earlier chunks and reports exactly how far it got.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, params, params_from_iter};
use serde::Serialize;

use crate::core::errors::{IngestError, Result};
use crate::ingest::{DeviceLatestRecord, PositionRecord};
use crate::store::{ChunkReport, LatestWritePolicy, PositionSink, RunRow, format_timestamp};

/// Default and ceiling for history page size.
pub const DEFAULT_PAGE_SIZE: u32 = 200;
pub const MAX_PAGE_SIZE: u32 = 2000;

const UPSERT_POSITION: &str = "INSERT INTO positions (
        external_id, device_id, fix_time, server_time, latitude, longitude,
        altitude, speed, course, valid, address, attributes, created_at, updated_at
    ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?13)
    ON CONFLICT(external_id) DO UPDATE SET
        device_id = excluded.device_id,
        fix_time = excluded.fix_time,
        server_time = excluded.server_time,
        latitude = excluded.latitude,
        longitude = excluded.longitude,
        altitude = excluded.altitude,
        speed = excluded.speed,
        course = excluded.course,
        valid = excluded.valid,
        address = excluded.address,
        attributes = excluded.attributes,
        updated_at = excluded.updated_at";

const UPSERT_LATEST: &str = "INSERT INTO device_latest_positions (
        device_id, last_external_id, fix_time, server_time, latitude, longitude,
        altitude, speed, course, valid, address, attributes, created_at, updated_at
    ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?13)
    ON CONFLICT(device_id) DO UPDATE SET
        last_external_id = excluded.last_external_id,
        fix_time = excluded.fix_time,
        server_time = excluded.server_time,
        latitude = excluded.latitude,
        longitude = excluded.longitude,
        altitude = excluded.altitude,
        speed = excluded.speed,
        course = excluded.course,
        valid = excluded.valid,
        address = excluded.address,
        attributes = excluded.attributes,
        updated_at = excluded.updated_at";

const NEWER_ONLY_GUARD: &str = "
    WHERE device_latest_positions.fix_time IS NULL
       OR (excluded.fix_time IS NOT NULL
           AND excluded.fix_time >= device_latest_positions.fix_time)";

const POSITION_COLUMNS: &str = "external_id, device_id, fix_time, server_time, latitude, longitude,
        altitude, speed, course, valid, address, attributes, created_at, updated_at";

const LATEST_COLUMNS: &str = "device_id, last_external_id, fix_time, server_time, latitude,
        longitude, altitude, speed, course, valid, address, attributes, created_at, updated_at";

/// A history row as stored. Timestamps are RFC 3339 text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredPosition {
    pub external_id: i64,
    pub device_id: i64,
    pub fix_time: Option<String>,
    pub server_time: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub course: Option<i64>,
    pub valid: bool,
    pub address: Option<String>,
    pub attributes: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A latest-projection row as stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredLatest {
    pub device_id: i64,
    pub last_external_id: i64,
    pub fix_time: Option<String>,
    pub server_time: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub course: Option<i64>,
    pub valid: bool,
    pub address: Option<String>,
    pub attributes: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Filters for a paged history query. Every filter is optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryQuery {
    pub device_id: Option<i64>,
    pub valid: Option<bool>,
    /// Inclusive lower bound on `fix_time`.
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `fix_time`.
    pub to: Option<DateTime<Utc>>,
    /// Inclusive `(min, max)` latitude band.
    pub latitude: Option<(f64, f64)>,
    /// Inclusive `(min, max)` longitude band.
    pub longitude: Option<(f64, f64)>,
    pub speed_min: Option<f64>,
    pub speed_max: Option<f64>,
    /// Page size; clamped to `1..=2000`, default 200.
    pub limit: Option<u32>,
    /// 1-based page number; values below 1 read as 1.
    pub page: Option<u32>,
}

impl HistoryQuery {
    #[must_use]
    pub fn per_page(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }

    #[must_use]
    pub fn current_page(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }

    fn where_clause(&self) -> (String, Vec<SqlValue>) {
        let mut clauses: Vec<&'static str> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        if let Some(device_id) = self.device_id {
            clauses.push("device_id = ?");
            values.push(SqlValue::Integer(device_id));
        }
        if let Some(valid) = self.valid {
            clauses.push("valid = ?");
            values.push(SqlValue::Integer(i64::from(valid)));
        }
        if let Some(from) = self.from {
            clauses.push("fix_time >= ?");
            values.push(SqlValue::Text(format_timestamp(from)));
        }
        if let Some(to) = self.to {
            clauses.push("fix_time <= ?");
            values.push(SqlValue::Text(format_timestamp(to)));
        }
        if let Some((min, max)) = self.latitude {
            clauses.push("latitude BETWEEN ? AND ?");
            values.push(SqlValue::Real(min));
            values.push(SqlValue::Real(max));
        }
        if let Some((min, max)) = self.longitude {
            clauses.push("longitude BETWEEN ? AND ?");
            values.push(SqlValue::Real(min));
            values.push(SqlValue::Real(max));
        }
        if let Some(min) = self.speed_min {
            clauses.push("speed >= ?");
            values.push(SqlValue::Real(min));
        }
        if let Some(max) = self.speed_max {
            clauses.push("speed <= ?");
            values.push(SqlValue::Real(max));
        }

        if clauses.is_empty() {
            (String::new(), values)
        } else {
            (format!(" WHERE {}", clauses.join(" AND ")), values)
        }
    }
}

/// Pagination metadata for a history page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageMeta {
    pub total: u64,
    pub per_page: u32,
    pub current_page: u32,
    pub last_page: u32,
    /// 1-based index of the first row on this page, if any.
    pub from: Option<u64>,
    pub to: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPage {
    pub data: Vec<StoredPosition>,
    pub meta: PageMeta,
}

/// SQLite-backed [`PositionSink`] plus read queries.
pub struct PositionStore {
    conn: Connection,
    path: PathBuf,
    chunk_size: usize,
    latest_policy: LatestWritePolicy,
}

impl PositionStore {
    /// Open (or create) the database at `path`, applying schema and PRAGMAs.
    pub fn open(path: &Path, chunk_size: usize, latest_policy: LatestWritePolicy) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| IngestError::io(parent, source))?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        apply_pragmas(&conn)?;
        apply_schema(&conn)?;

        Ok(Self {
            conn,
            path: path.to_path_buf(),
            chunk_size: chunk_size.max(1),
            latest_policy,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub const fn latest_policy(&self) -> LatestWritePolicy {
        self.latest_policy
    }

    /// Check if WAL mode is active.
    pub fn is_wal_mode(&self) -> bool {
        self.conn
            .query_row("PRAGMA journal_mode", [], |row| row.get::<_, String>(0))
            .is_ok_and(|mode| mode.eq_ignore_ascii_case("wal"))
    }

    // ──────────────────── positions ────────────────────

    pub fn count_positions(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM positions", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    pub fn get_position(&self, external_id: i64) -> Result<Option<StoredPosition>> {
        let sql = format!("SELECT {POSITION_COLUMNS} FROM positions WHERE external_id = ?1");
        let row = self
            .conn
            .prepare_cached(&sql)?
            .query_row(params![external_id], position_from_row)
            .optional()?;
        Ok(row)
    }

    /// Filtered, paged history, newest fix first.
    pub fn history(&self, query: &HistoryQuery) -> Result<HistoryPage> {
        let (where_sql, values) = query.where_clause();
        let per_page = query.per_page();
        let current_page = query.current_page();

        let total: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM positions{where_sql}"),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;
        let total = u64::try_from(total).unwrap_or(0);

        let offset = u64::from(current_page - 1) * u64::from(per_page);
        let mut page_values = values;
        page_values.push(SqlValue::Integer(i64::from(per_page)));
        page_values.push(SqlValue::Integer(i64::try_from(offset).unwrap_or(i64::MAX)));

        let sql = format!(
            "SELECT {POSITION_COLUMNS} FROM positions{where_sql}
             ORDER BY fix_time IS NULL, fix_time DESC, external_id DESC
             LIMIT ? OFFSET ?"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let data = stmt
            .query_map(params_from_iter(page_values.iter()), position_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let last_page = u32::try_from(total.div_ceil(u64::from(per_page)))
            .unwrap_or(u32::MAX)
            .max(1);
        let (from, to) = if data.is_empty() {
            (None, None)
        } else {
            (Some(offset + 1), Some(offset + data.len() as u64))
        };

        Ok(HistoryPage {
            data,
            meta: PageMeta {
                total,
                per_page,
                current_page,
                last_page,
                from,
                to,
            },
        })
    }

    // ──────────────────── device_latest_positions ────────────────────

    /// Latest known position per device, newest fix first.
    pub fn latest_positions(&self, limit: Option<u32>) -> Result<Vec<StoredLatest>> {
        let sql = format!(
            "SELECT {LATEST_COLUMNS} FROM device_latest_positions
             ORDER BY fix_time IS NULL, fix_time DESC, device_id ASC
             LIMIT ?1"
        );
        let limit = limit.map_or(-1, i64::from);
        let rows = self
            .conn
            .prepare_cached(&sql)?
            .query_map(params![limit], latest_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_latest(&self, device_id: i64) -> Result<Option<StoredLatest>> {
        let sql = format!("SELECT {LATEST_COLUMNS} FROM device_latest_positions WHERE device_id = ?1");
        let row = self
            .conn
            .prepare_cached(&sql)?
            .query_row(params![device_id], latest_from_row)
            .optional()?;
        Ok(row)
    }

    pub fn count_latest(&self) -> Result<u64> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM device_latest_positions", [], |row| {
                    row.get(0)
                })?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    // ──────────────────── ingest_runs ────────────────────

    /// Most recent runs, newest first.
    pub fn recent_runs(&self, limit: u32) -> Result<Vec<RunRow>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT started_at, finished_at, status, source, preference, device_filter,
                    fetched, normalized, discarded, rows_persisted, chunks_committed,
                    devices_updated, duration_ms, error_code, error_message
             FROM ingest_runs ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(RunRow {
                    started_at: row.get(0)?,
                    finished_at: row.get(1)?,
                    status: row.get(2)?,
                    source: row.get(3)?,
                    preference: row.get(4)?,
                    device_filter: row.get(5)?,
                    fetched: row.get(6)?,
                    normalized: row.get(7)?,
                    discarded: row.get(8)?,
                    rows_persisted: row.get(9)?,
                    chunks_committed: row.get(10)?,
                    devices_updated: row.get(11)?,
                    duration_ms: row.get(12)?,
                    error_code: row.get(13)?,
                    error_message: row.get(14)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn write_positions_chunk(&mut self, chunk: &[PositionRecord], stamp: &str) -> rusqlite::Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(UPSERT_POSITION)?;
            for record in chunk {
                stmt.execute(params![
                    record.external_id,
                    record.device_id,
                    record.fix_time.map(format_timestamp),
                    record.server_time.map(format_timestamp),
                    record.latitude,
                    record.longitude,
                    record.altitude,
                    record.speed,
                    record.course,
                    record.valid,
                    record.address,
                    record.attributes,
                    stamp,
                ])?;
            }
        }
        tx.commit()
    }
}

impl PositionSink for PositionStore {
    fn upsert_positions(
        &mut self,
        records: &[PositionRecord],
        written_at: DateTime<Utc>,
    ) -> Result<ChunkReport> {
        let stamp = format_timestamp(written_at);
        let chunk_size = self.chunk_size;
        let mut report = ChunkReport {
            chunks_total: records.len().div_ceil(chunk_size),
            ..ChunkReport::default()
        };

        for (index, chunk) in records.chunks(chunk_size).enumerate() {
            if let Err(err) = self.write_positions_chunk(chunk, &stamp) {
                if report.chunks_committed == 0 {
                    return Err(IngestError::Sql {
                        context: "upsert_positions",
                        details: err.to_string(),
                    });
                }
                return Err(IngestError::PartialWrite {
                    failed_chunk: index + 1,
                    chunks_total: report.chunks_total,
                    rows_committed: report.rows_committed,
                    details: err.to_string(),
                });
            }
            report.chunks_committed += 1;
            report.rows_committed += chunk.len();
        }
        Ok(report)
    }

    fn upsert_latest(
        &mut self,
        records: &[DeviceLatestRecord],
        written_at: DateTime<Utc>,
    ) -> Result<usize> {
        let stamp = format_timestamp(written_at);
        let sql = match self.latest_policy {
            LatestWritePolicy::Overwrite => UPSERT_LATEST.to_string(),
            LatestWritePolicy::NewerOnly => format!("{UPSERT_LATEST}{NEWER_ONLY_GUARD}"),
        };

        let tx = self.conn.transaction()?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare_cached(&sql)?;
            for record in records {
                changed += stmt.execute(params![
                    record.device_id,
                    record.last_external_id,
                    record.fix_time.map(format_timestamp),
                    record.server_time.map(format_timestamp),
                    record.latitude,
                    record.longitude,
                    record.altitude,
                    record.speed,
                    record.course,
                    record.valid,
                    record.address,
                    record.attributes,
                    stamp,
                ])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    fn record_run(&mut self, run: &RunRow) -> Result<()> {
        self.conn
            .prepare_cached(
                "INSERT INTO ingest_runs (
                started_at, finished_at, status, source, preference, device_filter,
                fetched, normalized, discarded, rows_persisted, chunks_committed,
                devices_updated, duration_ms, error_code, error_message
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
            )?
            .execute(params![
                run.started_at,
                run.finished_at,
                run.status,
                run.source,
                run.preference,
                run.device_filter,
                run.fetched,
                run.normalized,
                run.discarded,
                run.rows_persisted,
                run.chunks_committed,
                run.devices_updated,
                run.duration_ms,
                run.error_code,
                run.error_message,
            ])?;
        Ok(())
    }
}

fn position_from_row(row: &Row<'_>) -> rusqlite::Result<StoredPosition> {
    Ok(StoredPosition {
        external_id: row.get(0)?,
        device_id: row.get(1)?,
        fix_time: row.get(2)?,
        server_time: row.get(3)?,
        latitude: row.get(4)?,
        longitude: row.get(5)?,
        altitude: row.get(6)?,
        speed: row.get(7)?,
        course: row.get(8)?,
        valid: row.get(9)?,
        address: row.get(10)?,
        attributes: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn latest_from_row(row: &Row<'_>) -> rusqlite::Result<StoredLatest> {
    Ok(StoredLatest {
        device_id: row.get(0)?,
        last_external_id: row.get(1)?,
        fix_time: row.get(2)?,
        server_time: row.get(3)?,
        latitude: row.get(4)?,
        longitude: row.get(5)?,
        altitude: row.get(6)?,
        speed: row.get(7)?,
        course: row.get(8)?,
        valid: row.get(9)?,
        address: row.get(10)?,
        attributes: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -8000;
         PRAGMA temp_store = MEMORY;
         PRAGMA busy_timeout = 5000;",
    )?;
    let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        eprintln!("[GPI-SQLITE] WARNING: requested WAL mode but got '{mode}'");
    }
    Ok(())
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS positions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            external_id INTEGER NOT NULL UNIQUE,
            device_id INTEGER NOT NULL,
            fix_time TEXT,
            server_time TEXT,
            latitude REAL,
            longitude REAL,
            altitude REAL,
            speed REAL,
            course INTEGER,
            valid INTEGER NOT NULL DEFAULT 1,
            address TEXT,
            attributes TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS device_latest_positions (
            device_id INTEGER PRIMARY KEY,
            last_external_id INTEGER NOT NULL,
            fix_time TEXT,
            server_time TEXT,
            latitude REAL,
            longitude REAL,
            altitude REAL,
            speed REAL,
            course INTEGER,
            valid INTEGER NOT NULL DEFAULT 1,
            address TEXT,
            attributes TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS ingest_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            started_at TEXT NOT NULL,
            finished_at TEXT NOT NULL,
            status TEXT NOT NULL,
            source TEXT,
            preference TEXT NOT NULL,
            device_filter INTEGER,
            fetched INTEGER NOT NULL DEFAULT 0,
            normalized INTEGER NOT NULL DEFAULT 0,
            discarded INTEGER NOT NULL DEFAULT 0,
            rows_persisted INTEGER NOT NULL DEFAULT 0,
            chunks_committed INTEGER NOT NULL DEFAULT 0,
            devices_updated INTEGER NOT NULL DEFAULT 0,
            duration_ms INTEGER NOT NULL DEFAULT 0,
            error_code TEXT,
            error_message TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_positions_device_fix ON positions(device_id, fix_time);
        CREATE INDEX IF NOT EXISTS idx_positions_device ON positions(device_id);
        CREATE INDEX IF NOT EXISTS idx_positions_fix_time ON positions(fix_time);
        CREATE INDEX IF NOT EXISTS idx_positions_server_time ON positions(server_time);
        CREATE INDEX IF NOT EXISTS idx_latest_fix_time ON device_latest_positions(fix_time);
        CREATE INDEX IF NOT EXISTS idx_runs_started ON ingest_runs(started_at);",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::reduce_latest;
    use chrono::TimeZone;

    fn temp_store(chunk_size: usize, policy: LatestWritePolicy) -> (tempfile::TempDir, PositionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::open(&dir.path().join("positions.sqlite3"), chunk_size, policy)
            .unwrap();
        (dir, store)
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap()
    }

    fn position(external_id: i64, device_id: i64, fix: Option<DateTime<Utc>>) -> PositionRecord {
        PositionRecord {
            external_id,
            device_id,
            fix_time: fix,
            server_time: None,
            latitude: Some(52.0 + external_id as f64 / 1000.0),
            longitude: Some(4.0),
            altitude: None,
            speed: Some(external_id as f64),
            course: Some(90),
            valid: external_id % 2 == 0,
            address: None,
            attributes: Some(r#"{"ignition":true}"#.to_string()),
        }
    }

    #[test]
    fn schema_created_and_wal_active() {
        let (_dir, store) = temp_store(1000, LatestWritePolicy::Overwrite);
        assert!(store.is_wal_mode());
        assert_eq!(store.count_positions().unwrap(), 0);
        assert_eq!(store.count_latest().unwrap(), 0);
    }

    #[test]
    fn reupsert_preserves_created_at_and_bumps_updated_at() {
        let (_dir, mut store) = temp_store(1000, LatestWritePolicy::Overwrite);
        let mut record = position(1, 7, Some(at(0)));
        store.upsert_positions(&[record.clone()], at(1)).unwrap();

        record.speed = Some(99.0);
        store.upsert_positions(&[record], at(2)).unwrap();

        let stored = store.get_position(1).unwrap().unwrap();
        assert_eq!(stored.speed, Some(99.0));
        assert_eq!(stored.created_at, "2024-01-01T00:01:00.000Z");
        assert_eq!(stored.updated_at, "2024-01-01T00:02:00.000Z");
        assert_eq!(store.count_positions().unwrap(), 1);
    }

    #[test]
    fn chunking_reports_every_chunk() {
        let (_dir, mut store) = temp_store(1000, LatestWritePolicy::Overwrite);
        let batch: Vec<PositionRecord> = (1..=2500).map(|id| position(id, id % 10 + 1, None)).collect();
        let report = store.upsert_positions(&batch, at(0)).unwrap();
        assert_eq!(
            report,
            ChunkReport {
                chunks_total: 3,
                chunks_committed: 3,
                rows_committed: 2500
            }
        );
        assert_eq!(store.count_positions().unwrap(), 2500);
    }

    #[test]
    fn failing_chunk_keeps_earlier_chunks() {
        let (_dir, mut store) = temp_store(1000, LatestWritePolicy::Overwrite);
        store
            .conn
            .execute_batch(
                "CREATE TRIGGER reject_1500 BEFORE INSERT ON positions
                 WHEN NEW.external_id = 1500
                 BEGIN SELECT RAISE(ABORT, 'rejected by test trigger'); END;",
            )
            .unwrap();

        let batch: Vec<PositionRecord> = (1..=2500).map(|id| position(id, 1, None)).collect();
        let err = store.upsert_positions(&batch, at(0)).unwrap_err();
        match err {
            IngestError::PartialWrite {
                failed_chunk,
                chunks_total,
                rows_committed,
                ..
            } => {
                assert_eq!(failed_chunk, 2);
                assert_eq!(chunks_total, 3);
                assert_eq!(rows_committed, 1000);
            }
            other => panic!("expected PartialWrite, got {other}"),
        }
        // The failed chunk rolled back as a unit; nothing after it ran.
        assert_eq!(store.count_positions().unwrap(), 1000);
    }

    #[test]
    fn failing_first_chunk_is_a_plain_sql_error() {
        let (_dir, mut store) = temp_store(1000, LatestWritePolicy::Overwrite);
        store
            .conn
            .execute_batch(
                "CREATE TRIGGER reject_all BEFORE INSERT ON positions
                 BEGIN SELECT RAISE(ABORT, 'read only'); END;",
            )
            .unwrap();
        let err = store
            .upsert_positions(&[position(1, 1, None)], at(0))
            .unwrap_err();
        assert_eq!(err.code(), "GPI-2501");
        assert_eq!(store.count_positions().unwrap(), 0);
    }

    #[test]
    fn latest_overwrite_can_regress() {
        let (_dir, mut store) = temp_store(1000, LatestWritePolicy::Overwrite);
        let newer = reduce_latest(&[position(2, 7, Some(at(5)))]);
        let older = reduce_latest(&[position(1, 7, Some(at(0)))]);
        store.upsert_latest(&newer.into_values().collect::<Vec<_>>(), at(6)).unwrap();
        let changed = store
            .upsert_latest(&older.into_values().collect::<Vec<_>>(), at(7))
            .unwrap();
        assert_eq!(changed, 1);
        let row = store.get_latest(7).unwrap().unwrap();
        assert_eq!(row.last_external_id, 1);
        assert_eq!(row.created_at, "2024-01-01T00:06:00.000Z");
    }

    #[test]
    fn latest_newer_only_refuses_stale_batch() {
        let (_dir, mut store) = temp_store(1000, LatestWritePolicy::NewerOnly);
        let newer = reduce_latest(&[position(2, 7, Some(at(5)))]);
        let older = reduce_latest(&[position(1, 7, Some(at(0)))]);
        let undated = reduce_latest(&[position(3, 7, None)]);
        store.upsert_latest(&newer.into_values().collect::<Vec<_>>(), at(6)).unwrap();

        let changed = store
            .upsert_latest(&older.into_values().collect::<Vec<_>>(), at(7))
            .unwrap();
        assert_eq!(changed, 0);
        let changed = store
            .upsert_latest(&undated.into_values().collect::<Vec<_>>(), at(8))
            .unwrap();
        assert_eq!(changed, 0);

        let row = store.get_latest(7).unwrap().unwrap();
        assert_eq!(row.last_external_id, 2);
        assert_eq!(row.fix_time.as_deref(), Some("2024-01-01T00:05:00.000Z"));
    }

    #[test]
    fn newer_only_replaces_undated_row() {
        let (_dir, mut store) = temp_store(1000, LatestWritePolicy::NewerOnly);
        let undated = reduce_latest(&[position(3, 7, None)]);
        let dated = reduce_latest(&[position(4, 7, Some(at(0)))]);
        store.upsert_latest(&undated.into_values().collect::<Vec<_>>(), at(1)).unwrap();
        store.upsert_latest(&dated.into_values().collect::<Vec<_>>(), at(2)).unwrap();
        assert_eq!(store.get_latest(7).unwrap().unwrap().last_external_id, 4);
    }

    #[test]
    fn history_filters_and_paginates() {
        let (_dir, mut store) = temp_store(1000, LatestWritePolicy::Overwrite);
        let batch: Vec<PositionRecord> = (1..=30)
            .map(|id| position(id, if id <= 20 { 1 } else { 2 }, Some(at(u32::try_from(id).unwrap()))))
            .collect();
        store.upsert_positions(&batch, at(59)).unwrap();

        let page = store
            .history(&HistoryQuery {
                device_id: Some(1),
                limit: Some(8),
                page: Some(3),
                ..HistoryQuery::default()
            })
            .unwrap();
        assert_eq!(page.meta.total, 20);
        assert_eq!(page.meta.last_page, 3);
        assert_eq!(page.meta.from, Some(17));
        assert_eq!(page.meta.to, Some(20));
        assert_eq!(page.data.len(), 4);
        // Newest fix first: page 3 holds the four oldest.
        assert_eq!(page.data[0].external_id, 4);
        assert_eq!(page.data[3].external_id, 1);

        let filtered = store
            .history(&HistoryQuery {
                valid: Some(true),
                from: Some(at(10)),
                to: Some(at(20)),
                speed_min: Some(12.0),
                ..HistoryQuery::default()
            })
            .unwrap();
        let ids: Vec<i64> = filtered.data.iter().map(|p| p.external_id).collect();
        assert_eq!(ids, vec![20, 18, 16, 14, 12]);
    }

    #[test]
    fn history_clamps_page_size() {
        let (_dir, store) = temp_store(1000, LatestWritePolicy::Overwrite);
        let page = store
            .history(&HistoryQuery {
                limit: Some(0),
                page: Some(0),
                ..HistoryQuery::default()
            })
            .unwrap();
        assert_eq!(page.meta.per_page, 1);
        assert_eq!(page.meta.current_page, 1);
        assert_eq!(page.meta.last_page, 1);
        assert_eq!(page.meta.from, None);
        assert_eq!(
            HistoryQuery {
                limit: Some(50_000),
                ..HistoryQuery::default()
            }
            .per_page(),
            MAX_PAGE_SIZE
        );
    }

    #[test]
    fn latest_positions_newest_first() {
        let (_dir, mut store) = temp_store(1000, LatestWritePolicy::Overwrite);
        let latest = reduce_latest(&[
            position(1, 1, Some(at(1))),
            position(2, 2, Some(at(9))),
            position(3, 3, None),
        ]);
        store.upsert_latest(&latest.into_values().collect::<Vec<_>>(), at(10)).unwrap();
        let rows = store.latest_positions(None).unwrap();
        let devices: Vec<i64> = rows.iter().map(|r| r.device_id).collect();
        assert_eq!(devices, vec![2, 1, 3]);
        assert_eq!(store.latest_positions(Some(1)).unwrap().len(), 1);
    }

    #[test]
    fn run_history_roundtrip() {
        let (_dir, mut store) = temp_store(1000, LatestWritePolicy::Overwrite);
        for status in ["success", "failure"] {
            store
                .record_run(&RunRow {
                    started_at: "2024-01-01T00:00:00.000Z".to_string(),
                    finished_at: "2024-01-01T00:00:01.000Z".to_string(),
                    status: status.to_string(),
                    source: Some("primary".to_string()),
                    preference: "auto".to_string(),
                    device_filter: None,
                    fetched: 3,
                    normalized: 2,
                    discarded: 1,
                    rows_persisted: 2,
                    chunks_committed: 1,
                    devices_updated: 1,
                    duration_ms: 1000,
                    error_code: None,
                    error_message: None,
                })
                .unwrap();
        }
        let runs = store.recent_runs(10).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].status, "failure");
        assert_eq!(runs[1].discarded, 1);
    }
}
