//! Durable storage for position history, the latest projection, and run history.

#![allow(missing_docs)]

pub mod sqlite;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::Result;
use crate::ingest::{DeviceLatestRecord, PositionRecord};

pub use sqlite::{HistoryPage, HistoryQuery, PageMeta, PositionStore, StoredLatest, StoredPosition};

/// How the latest projection treats an existing row for the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatestWritePolicy {
    /// Replace the row with the batch's reduction unconditionally.
    #[default]
    Overwrite,
    /// Replace only when the stored fix is missing or not newer than the incoming one.
    NewerOnly,
}

impl LatestWritePolicy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Overwrite => "overwrite",
            Self::NewerOnly => "newer_only",
        }
    }
}

impl fmt::Display for LatestWritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LatestWritePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "overwrite" => Ok(Self::Overwrite),
            "newer_only" => Ok(Self::NewerOnly),
            other => Err(format!(
                "unknown latest policy {other:?} (expected overwrite or newer_only)"
            )),
        }
    }
}

/// Progress of a chunked positions write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ChunkReport {
    pub chunks_total: usize,
    pub chunks_committed: usize,
    pub rows_committed: usize,
}

impl ChunkReport {
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.chunks_committed == self.chunks_total
    }
}

/// One row of `ingest_runs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunRow {
    pub started_at: String,
    pub finished_at: String,
    pub status: String,
    pub source: Option<String>,
    pub preference: String,
    pub device_filter: Option<i64>,
    pub fetched: i64,
    pub normalized: i64,
    pub discarded: i64,
    pub rows_persisted: i64,
    pub chunks_committed: i64,
    pub devices_updated: i64,
    pub duration_ms: i64,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

/// Write side of the pipeline.
///
/// Both upserts must be idempotent: re-applying the same batch leaves the
/// same stored state and never moves `created_at`.
pub trait PositionSink {
    /// Upsert history rows keyed on `external_id`, chunk by chunk.
    ///
    /// Each chunk commits on its own. A failure after at least one committed
    /// chunk is reported as [`IngestError::PartialWrite`](crate::core::errors::IngestError::PartialWrite).
    fn upsert_positions(
        &mut self,
        records: &[PositionRecord],
        written_at: DateTime<Utc>,
    ) -> Result<ChunkReport>;

    /// Upsert the latest projection keyed on `device_id`. Returns rows changed.
    fn upsert_latest(
        &mut self,
        records: &[DeviceLatestRecord],
        written_at: DateTime<Utc>,
    ) -> Result<usize>;

    /// Append a run summary. Sinks without run history ignore it.
    fn record_run(&mut self, _run: &RunRow) -> Result<()> {
        Ok(())
    }
}

/// Storage text form for timestamps: RFC 3339, UTC, millisecond precision.
#[must_use]
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}
