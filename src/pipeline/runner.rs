//! One ingestion run: fetch → normalize → reduce → persist.
//!
//! The runner never returns an error. Every way a run can end is folded into a
//! [`RunOutcome`] whose [`RunStatus`] the caller maps to an exit code, and the
//! outcome is written to the run log and the `ingest_runs` table on the way out.

#![allow(missing_docs)]

use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::errors::{ErrorClass, IngestError};
use crate::ingest::{normalize_batch, reduce_latest};
use crate::logger::EventSink;
use crate::logger::jsonl::{EventType, LogEntry, Severity};
use crate::source::fetcher::{FetchAttempt, SourceFetcher};
use crate::source::{SourceKind, SourcePreference};
use crate::store::{ChunkReport, PositionSink, RunRow, format_timestamp};

/// What to ingest on this invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RunRequest {
    pub preference: SourcePreference,
    pub device_id: Option<i64>,
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Both writes confirmed, or nothing to write.
    Success,
    /// Some position chunks committed before a write failed.
    Partial,
    Failure,
    /// Another run held the single-flight lock.
    Skipped,
}

impl RunStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failure => "failure",
            Self::Skipped => "skipped",
        }
    }

    /// Whether monitoring should treat the run as healthy.
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Success | Self::Skipped)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// States the runner passes through, recorded in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", content = "detail", rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Fetching(SourceKind),
    Normalizing,
    Reducing,
    Persisting,
    Done(RunStatus),
}

/// Everything a caller needs to report on one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub request: RunRequest,
    /// Provider whose payload was used; `None` when nothing answered.
    pub source: Option<SourceKind>,
    pub fetched: usize,
    pub normalized: usize,
    pub discarded: usize,
    pub rows_persisted: usize,
    pub devices_updated: usize,
    pub chunks: ChunkReport,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub error_code: Option<&'static str>,
    pub error_class: Option<ErrorClass>,
    pub error_message: Option<String>,
    pub attempts: Vec<FetchAttempt>,
    pub phases: Vec<RunPhase>,
}

impl RunOutcome {
    fn begin(request: RunRequest, started_at: DateTime<Utc>) -> Self {
        Self {
            status: RunStatus::Success,
            request,
            source: None,
            fetched: 0,
            normalized: 0,
            discarded: 0,
            rows_persisted: 0,
            devices_updated: 0,
            chunks: ChunkReport::default(),
            started_at,
            elapsed_ms: 0,
            error_code: None,
            error_class: None,
            error_message: None,
            attempts: Vec::new(),
            phases: vec![RunPhase::Idle],
        }
    }

    /// A run that never started because the single-flight lock was held.
    #[must_use]
    pub fn skipped(request: RunRequest, at: DateTime<Utc>, reason: &IngestError) -> Self {
        let mut outcome = Self::begin(request, at);
        outcome.fail(RunStatus::Skipped, reason);
        outcome.phases.push(RunPhase::Done(RunStatus::Skipped));
        outcome
    }

    /// A run that could not be set up (store, providers, or lock unusable).
    #[must_use]
    pub fn failed(request: RunRequest, at: DateTime<Utc>, reason: &IngestError) -> Self {
        let mut outcome = Self::begin(request, at);
        outcome.fail(RunStatus::Failure, reason);
        outcome.phases.push(RunPhase::Done(RunStatus::Failure));
        outcome
    }

    fn fail(&mut self, status: RunStatus, error: &IngestError) {
        self.status = status;
        self.error_code = Some(error.code());
        self.error_class = Some(error.class());
        self.error_message = Some(error.to_string());
    }

    /// `status=<s> source=<s> rows=<n> devices=<n> discarded=<n> elapsed_ms=<n>`
    #[must_use]
    pub fn summary_line(&self) -> String {
        format!(
            "status={} source={} rows={} devices={} discarded={} elapsed_ms={}",
            self.status,
            self.source.map_or("none", SourceKind::as_str),
            self.rows_persisted,
            self.devices_updated,
            self.discarded,
            self.elapsed_ms,
        )
    }

    /// Row for the `ingest_runs` table.
    #[must_use]
    pub fn to_run_row(&self) -> RunRow {
        let finished_at = self.started_at
            + chrono::Duration::milliseconds(i64::try_from(self.elapsed_ms).unwrap_or(i64::MAX));
        RunRow {
            started_at: format_timestamp(self.started_at),
            finished_at: format_timestamp(finished_at),
            status: self.status.as_str().to_string(),
            source: self.source.map(|s| s.as_str().to_string()),
            preference: self.request.preference.as_str().to_string(),
            device_filter: self.request.device_id,
            fetched: to_i64(self.fetched),
            normalized: to_i64(self.normalized),
            discarded: to_i64(self.discarded),
            rows_persisted: to_i64(self.rows_persisted),
            chunks_committed: to_i64(self.chunks.chunks_committed),
            devices_updated: to_i64(self.devices_updated),
            duration_ms: i64::try_from(self.elapsed_ms).unwrap_or(i64::MAX),
            error_code: self.error_code.map(str::to_string),
            error_message: self.error_message.clone(),
        }
    }

    /// Terminal run-log entry for this outcome.
    #[must_use]
    pub fn log_entry(&self) -> LogEntry {
        let (event, severity) = match self.status {
            RunStatus::Success => (EventType::RunComplete, Severity::Info),
            RunStatus::Skipped => (EventType::RunSkipped, Severity::Warning),
            RunStatus::Partial | RunStatus::Failure => (EventType::RunFailed, Severity::Critical),
        };
        let mut entry = LogEntry::new(event, severity);
        entry.source = Some(self.source.map_or("none", SourceKind::as_str).to_string());
        entry.status = Some(self.status.as_str().to_string());
        entry.rows = Some(self.rows_persisted as u64);
        entry.devices = Some(self.devices_updated as u64);
        entry.discarded = Some(self.discarded as u64);
        entry.duration_ms = Some(self.elapsed_ms);
        entry.error_code = self.error_code.map(str::to_string);
        entry.error_message.clone_from(&self.error_message);
        if self.status == RunStatus::Partial {
            entry.details = Some(format!(
                "chunks_committed={} chunks_total={}",
                self.chunks.chunks_committed, self.chunks.chunks_total
            ));
        }
        entry
    }
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Orchestrates one run against a fetcher and a sink.
pub struct PipelineRunner<S: PositionSink> {
    fetcher: SourceFetcher,
    sink: S,
    clock: fn() -> DateTime<Utc>,
}

impl<S: PositionSink> PipelineRunner<S> {
    pub fn new(fetcher: SourceFetcher, sink: S) -> Self {
        Self {
            fetcher,
            sink,
            clock: Utc::now,
        }
    }

    /// Replace the wall clock used for `written_at` and run timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Execute one run and record its outcome.
    pub fn run(&mut self, request: RunRequest, events: &mut dyn EventSink) -> RunOutcome {
        let started = Instant::now();
        let mut outcome = RunOutcome::begin(request, self.now());

        let mut start = LogEntry::new(EventType::RunStart, Severity::Info);
        start.details = Some(match request.device_id {
            Some(id) => format!("preference={} device_id={id}", request.preference.as_str()),
            None => format!("preference={}", request.preference.as_str()),
        });
        events.emit(&start);

        self.execute(request, &mut outcome, events);

        outcome.elapsed_ms = elapsed_ms(started);
        outcome.phases.push(RunPhase::Done(outcome.status));

        if let Err(e) = self.sink.record_run(&outcome.to_run_row()) {
            eprintln!("[GPI-STORE] failed to record run history: {e}");
        }
        events.emit(&outcome.log_entry());
        outcome
    }

    fn execute(&mut self, request: RunRequest, outcome: &mut RunOutcome, events: &mut dyn EventSink) {
        let phases = &mut outcome.phases;
        let fetched = self.fetcher.fetch(request.preference, request.device_id, |attempt| {
            phases.push(RunPhase::Fetching(attempt.source));
            events.emit(&attempt_entry(attempt));
        });

        let raw = match fetched {
            Ok(fetch) => {
                outcome.attempts = fetch.attempts;
                outcome.source = fetch.source;
                fetch.records
            }
            Err(err) => {
                outcome.attempts = err.attempts;
                emit_failovers(&outcome.attempts, events);
                outcome.fail(RunStatus::Failure, &err.error);
                return;
            }
        };
        emit_failovers(&outcome.attempts, events);

        outcome.fetched = raw.len();
        if raw.is_empty() {
            return;
        }

        outcome.phases.push(RunPhase::Normalizing);
        let batch = normalize_batch(&raw);
        outcome.normalized = batch.records.len();
        outcome.discarded = batch.discarded;
        if batch.records.is_empty() {
            return;
        }

        outcome.phases.push(RunPhase::Reducing);
        let latest: Vec<_> = reduce_latest(&batch.records).into_values().collect();

        outcome.phases.push(RunPhase::Persisting);
        let written_at = self.now();
        match self.sink.upsert_positions(&batch.records, written_at) {
            Ok(report) => {
                outcome.chunks = report;
                outcome.rows_persisted = report.rows_committed;
            }
            Err(err) => {
                if let IngestError::PartialWrite {
                    chunks_total,
                    rows_committed,
                    failed_chunk,
                    ..
                } = &err
                {
                    outcome.chunks = ChunkReport {
                        chunks_total: *chunks_total,
                        chunks_committed: failed_chunk.saturating_sub(1),
                        rows_committed: *rows_committed,
                    };
                    outcome.rows_persisted = *rows_committed;
                    outcome.fail(RunStatus::Partial, &err);
                } else {
                    outcome.fail(RunStatus::Failure, &err);
                }
                return;
            }
        }

        match self.sink.upsert_latest(&latest, written_at) {
            Ok(changed) => outcome.devices_updated = changed,
            Err(err) => outcome.fail(RunStatus::Failure, &err),
        }
    }
}

fn attempt_entry(attempt: &FetchAttempt) -> LogEntry {
    let severity = if attempt.is_success() {
        Severity::Info
    } else {
        Severity::Warning
    };
    let mut entry = LogEntry::new(EventType::SourceAttempt, severity);
    entry.source = Some(attempt.source.as_str().to_string());
    entry.status = Some(attempt.failure.unwrap_or("ok").to_string());
    entry.rows = attempt.records.map(|n| n as u64);
    entry.duration_ms = Some(u64::try_from(attempt.elapsed.as_millis()).unwrap_or(u64::MAX));
    entry.error_message.clone_from(&attempt.error);
    if let Some(status) = attempt.status {
        entry.details = Some(format!("http_status={status}"));
    }
    entry
}

fn emit_failovers(attempts: &[FetchAttempt], events: &mut dyn EventSink) {
    for pair in attempts.windows(2) {
        if !pair[0].is_success() {
            let mut entry = LogEntry::new(EventType::SourceFailover, Severity::Warning);
            entry.source = Some(pair[1].source.as_str().to_string());
            entry.details = Some(format!("from={} to={}", pair[0].source, pair[1].source));
            entry.error_message.clone_from(&pair[0].error);
            events.emit(&entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::{Result, UpstreamError, UpstreamFailure};
    use crate::ingest::{DeviceLatestRecord, PositionRecord};
    use crate::source::TelemetrySource;
    use crate::source::raw::RawRecord;
    use chrono::TimeZone;
    use serde_json::json;

    struct Fixed(std::result::Result<Vec<RawRecord>, UpstreamFailure>, SourceKind);

    impl TelemetrySource for Fixed {
        fn kind(&self) -> SourceKind {
            self.1
        }

        fn fetch_positions(
            &self,
            _device_id: Option<i64>,
        ) -> std::result::Result<Vec<RawRecord>, UpstreamError> {
            self.0
                .clone()
                .map_err(|kind| UpstreamError::new(self.1, kind, "fixed"))
        }
    }

    #[derive(Default)]
    struct MemorySink {
        positions: Vec<PositionRecord>,
        latest: Vec<DeviceLatestRecord>,
        runs: Vec<RunRow>,
        fail_positions: Option<fn() -> IngestError>,
        fail_latest: bool,
    }

    impl PositionSink for MemorySink {
        fn upsert_positions(
            &mut self,
            records: &[PositionRecord],
            _written_at: DateTime<Utc>,
        ) -> Result<ChunkReport> {
            if let Some(make) = self.fail_positions {
                return Err(make());
            }
            self.positions.extend_from_slice(records);
            Ok(ChunkReport {
                chunks_total: 1,
                chunks_committed: 1,
                rows_committed: records.len(),
            })
        }

        fn upsert_latest(
            &mut self,
            records: &[DeviceLatestRecord],
            _written_at: DateTime<Utc>,
        ) -> Result<usize> {
            if self.fail_latest {
                return Err(IngestError::Sql {
                    context: "test",
                    details: "latest unavailable".to_string(),
                });
            }
            self.latest.extend_from_slice(records);
            Ok(records.len())
        }

        fn record_run(&mut self, run: &RunRow) -> Result<()> {
            self.runs.push(run.clone());
            Ok(())
        }
    }

    fn fixed_clock() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn raws(value: serde_json::Value) -> Vec<RawRecord> {
        serde_json::from_value(value).unwrap()
    }

    fn runner(
        primary: Option<Fixed>,
        secondary: Option<Fixed>,
        sink: MemorySink,
    ) -> PipelineRunner<MemorySink> {
        let primary = primary.map(|s| Box::new(s) as Box<dyn TelemetrySource>);
        let secondary = secondary.map(|s| Box::new(s) as Box<dyn TelemetrySource>);
        PipelineRunner::new(SourceFetcher::new(primary, secondary), sink).with_clock(fixed_clock)
    }

    #[test]
    fn happy_path_walks_every_phase() {
        let records = raws(json!([
            {"id": 1, "deviceId": 7, "fixTime": "2024-01-01T00:00:00Z"},
            {"id": 2, "deviceId": 7, "fixTime": "2024-01-01T00:05:00Z"},
            {"id": 3, "deviceId": 8},
        ]));
        let mut runner = runner(Some(Fixed(Ok(records), SourceKind::Primary)), None, MemorySink::default());
        let mut events: Vec<LogEntry> = Vec::new();

        let outcome = runner.run(RunRequest::default(), &mut events);
        assert_eq!(outcome.status, RunStatus::Success);
        assert_eq!(outcome.source, Some(SourceKind::Primary));
        assert_eq!(outcome.rows_persisted, 3);
        assert_eq!(outcome.devices_updated, 2);
        assert_eq!(
            outcome.phases,
            vec![
                RunPhase::Idle,
                RunPhase::Fetching(SourceKind::Primary),
                RunPhase::Normalizing,
                RunPhase::Reducing,
                RunPhase::Persisting,
                RunPhase::Done(RunStatus::Success),
            ]
        );
        let sink = runner.sink();
        assert_eq!(sink.runs.len(), 1);
        assert_eq!(sink.runs[0].started_at, "2024-01-01T12:00:00.000Z");
        let seven = sink.latest.iter().find(|l| l.device_id == 7).unwrap();
        assert_eq!(seven.last_external_id, 2);

        let kinds: Vec<EventType> = events.iter().map(|e| e.event).collect();
        assert_eq!(
            kinds,
            vec![EventType::RunStart, EventType::SourceAttempt, EventType::RunComplete]
        );
    }

    #[test]
    fn failover_is_logged_and_reported() {
        let mut runner = runner(
            Some(Fixed(Err(UpstreamFailure::Timeout), SourceKind::Primary)),
            Some(Fixed(Ok(raws(json!([{"id": 5, "deviceId": 1}]))), SourceKind::Secondary)),
            MemorySink::default(),
        );
        let mut events: Vec<LogEntry> = Vec::new();
        let outcome = runner.run(RunRequest::default(), &mut events);

        assert_eq!(outcome.status, RunStatus::Success);
        assert_eq!(outcome.source, Some(SourceKind::Secondary));
        assert!(outcome.summary_line().contains("source=secondary"));
        assert!(events.iter().any(|e| e.event == EventType::SourceFailover));
    }

    #[test]
    fn empty_fetch_is_success_without_persisting() {
        let mut runner = runner(None, None, MemorySink::default());
        let outcome = runner.run(RunRequest::default(), &mut crate::logger::NullSink);
        assert_eq!(outcome.status, RunStatus::Success);
        assert_eq!(outcome.rows_persisted, 0);
        assert_eq!(
            outcome.phases,
            vec![RunPhase::Idle, RunPhase::Done(RunStatus::Success)]
        );
        assert!(outcome.summary_line().starts_with("status=success source=none rows=0"));
        assert_eq!(runner.sink().runs.len(), 1);
    }

    #[test]
    fn all_discarded_is_success_with_discard_count() {
        let records = raws(json!([{"id": 0, "deviceId": 1}, {"id": -5, "deviceId": 1}]));
        let mut runner = runner(Some(Fixed(Ok(records), SourceKind::Primary)), None, MemorySink::default());
        let outcome = runner.run(RunRequest::default(), &mut crate::logger::NullSink);
        assert_eq!(outcome.status, RunStatus::Success);
        assert_eq!(outcome.discarded, 2);
        assert!(runner.sink().positions.is_empty());
    }

    #[test]
    fn positions_failure_skips_latest_and_fails_run() {
        let sink = MemorySink {
            fail_positions: Some(|| IngestError::Sql {
                context: "test",
                details: "disk full".to_string(),
            }),
            ..MemorySink::default()
        };
        let records = raws(json!([{"id": 1, "deviceId": 1}]));
        let mut runner = runner(Some(Fixed(Ok(records), SourceKind::Primary)), None, sink);
        let outcome = runner.run(RunRequest::default(), &mut crate::logger::NullSink);

        assert_eq!(outcome.status, RunStatus::Failure);
        assert_eq!(outcome.error_code, Some("GPI-2501"));
        assert!(runner.sink().latest.is_empty());
        assert_eq!(runner.sink().runs[0].status, "failure");
    }

    #[test]
    fn partial_write_is_its_own_status() {
        let sink = MemorySink {
            fail_positions: Some(|| IngestError::PartialWrite {
                failed_chunk: 3,
                chunks_total: 3,
                rows_committed: 2000,
                details: "constraint".to_string(),
            }),
            ..MemorySink::default()
        };
        let records = raws(json!([{"id": 1, "deviceId": 1}]));
        let mut runner = runner(Some(Fixed(Ok(records), SourceKind::Primary)), None, sink);
        let mut events: Vec<LogEntry> = Vec::new();
        let outcome = runner.run(RunRequest::default(), &mut events);

        assert_eq!(outcome.status, RunStatus::Partial);
        assert_eq!(outcome.rows_persisted, 2000);
        assert_eq!(outcome.chunks.chunks_committed, 2);
        let last = events.last().unwrap();
        assert_eq!(last.event, EventType::RunFailed);
        assert_eq!(last.details.as_deref(), Some("chunks_committed=2 chunks_total=3"));
    }

    #[test]
    fn latest_failure_fails_run() {
        let sink = MemorySink {
            fail_latest: true,
            ..MemorySink::default()
        };
        let records = raws(json!([{"id": 1, "deviceId": 1}]));
        let mut runner = runner(Some(Fixed(Ok(records), SourceKind::Primary)), None, sink);
        let outcome = runner.run(RunRequest::default(), &mut crate::logger::NullSink);
        assert_eq!(outcome.status, RunStatus::Failure);
        assert_eq!(outcome.rows_persisted, 1);
    }

    #[test]
    fn explicit_source_failure_fails_run() {
        let mut runner = runner(
            Some(Fixed(Err(UpstreamFailure::Status), SourceKind::Primary)),
            None,
            MemorySink::default(),
        );
        let request = RunRequest {
            preference: SourcePreference::Primary,
            device_id: Some(3),
        };
        let outcome = runner.run(request, &mut crate::logger::NullSink);
        assert_eq!(outcome.status, RunStatus::Failure);
        assert_eq!(outcome.error_code, Some("GPI-2001"));
        assert_eq!(runner.sink().runs[0].device_filter, Some(3));
    }

    #[test]
    fn skipped_outcome_is_ok() {
        let busy = IngestError::LockBusy {
            path: "/tmp/ingest.lock".into(),
        };
        let outcome = RunOutcome::skipped(RunRequest::default(), fixed_clock(), &busy);
        assert!(outcome.status.is_ok());
        assert_eq!(outcome.log_entry().event, EventType::RunSkipped);
        assert!(outcome.summary_line().starts_with("status=skipped"));
    }

    #[test]
    fn setup_failure_outcome_reports_and_logs() {
        let err = IngestError::Sql {
            context: "open",
            details: "unable to open database file".to_string(),
        };
        let outcome = RunOutcome::failed(RunRequest::default(), fixed_clock(), &err);
        assert_eq!(outcome.status, RunStatus::Failure);
        assert_eq!(outcome.error_class, Some(ErrorClass::Storage));
        assert_eq!(
            outcome.summary_line(),
            "status=failure source=none rows=0 devices=0 discarded=0 elapsed_ms=0"
        );
        let entry = outcome.log_entry();
        assert_eq!(entry.event, EventType::RunFailed);
        assert_eq!(entry.error_code.as_deref(), Some("GPI-2501"));
    }
}
