//! JSONL run-event log: one self-contained JSON object per line.
//!
//! Lines are assembled in memory and written with a single `write_all` so a
//! tailing reader never sees a half line. Writes degrade through:
//! 1. Primary file path
//! 2. Fallback path (temp dir by default)
//! 3. stderr with `[GPI-JSONL]` prefix
//! 4. Silent discard (a run must never fail because logging failed)

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::core::errors::{IngestError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Run lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunStart,
    SourceAttempt,
    SourceFailover,
    RunComplete,
    RunFailed,
    RunSkipped,
    DaemonStart,
    DaemonStop,
}

/// A single JSONL log entry. Only `ts`, `event` and `severity` are always present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// RFC 3339 UTC timestamp, millisecond precision.
    pub ts: String,
    pub event: EventType,
    pub severity: Severity,
    /// Provider involved (`primary` / `secondary`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Run status or attempt result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Rows fetched (attempts) or persisted (run end).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub devices: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discarded: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// GPI error code when something failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Freeform details (JSON text or prose).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl LogEntry {
    /// Create a new entry stamped with the current UTC time.
    pub fn new(event: EventType, severity: Severity) -> Self {
        Self {
            ts: format_utc_now(),
            event,
            severity,
            source: None,
            status: None,
            rows: None,
            devices: None,
            discarded: None,
            duration_ms: None,
            error_code: None,
            error_message: None,
            details: None,
        }
    }
}

/// Where lines currently go. Each failure moves one step down the chain.
enum Target {
    Primary(BufWriter<File>),
    Fallback(BufWriter<File>),
    Stderr,
    Discard,
}

impl Target {
    const fn label(&self) -> &'static str {
        match self {
            Self::Primary(_) => "primary",
            Self::Fallback(_) => "fallback",
            Self::Stderr => "stderr",
            Self::Discard => "discard",
        }
    }

    fn file(&mut self) -> Option<&mut BufWriter<File>> {
        match self {
            Self::Primary(w) | Self::Fallback(w) => Some(w),
            Self::Stderr | Self::Discard => None,
        }
    }
}

/// Configuration for the JSONL writer.
#[derive(Debug, Clone)]
pub struct JsonlConfig {
    pub path: PathBuf,
    /// Used when `path` cannot be opened or written.
    pub fallback_path: Option<PathBuf>,
    /// Rotate once the file would exceed this size. Default: 50 MiB.
    pub max_size_bytes: u64,
    /// Rotated files kept (`runs.jsonl.1` .. `.N`). Default: 5.
    pub max_rotated_files: u32,
    /// Minimum spacing between `sync_data` calls.
    pub sync_interval: Duration,
}

impl JsonlConfig {
    /// Defaults with the primary file at `path`.
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("runs.jsonl"),
            fallback_path: Some(std::env::temp_dir().join("gpsi-runs.jsonl")),
            max_size_bytes: 50 * 1024 * 1024,
            max_rotated_files: 5,
            sync_interval: Duration::from_secs(10),
        }
    }
}

/// Append-only run-event writer with size rotation and a fallback chain.
pub struct JsonlWriter {
    config: JsonlConfig,
    target: Target,
    /// Size of the file behind `target`, including lines still buffered.
    file_len: u64,
    last_sync: Instant,
}

impl JsonlWriter {
    /// Open the primary file, or the first link of the chain that works.
    pub fn open(config: JsonlConfig) -> Self {
        let mut writer = Self {
            config,
            target: Target::Discard,
            file_len: 0,
            last_sync: Instant::now(),
        };
        match open_append(&writer.config.path) {
            Ok((file, len)) => {
                writer.target = Target::Primary(BufWriter::new(file));
                writer.file_len = len;
            }
            Err(e) => {
                eprintln!("[GPI-JSONL] cannot open run log: {e}");
                writer.open_fallback();
            }
        }
        writer
    }

    pub fn write_entry(&mut self, entry: &LogEntry) {
        match serde_json::to_string(entry) {
            Ok(mut line) => {
                line.push('\n');
                self.append(&line);
            }
            Err(e) => eprintln!("[GPI-JSONL] cannot serialize {:?} entry: {e}", entry.event),
        }
    }

    pub fn flush(&mut self) {
        if let Some(w) = self.target.file() {
            let _ = w.flush();
        }
    }

    /// `primary`, `fallback`, `stderr` or `discard`.
    pub fn state(&self) -> &'static str {
        self.target.label()
    }

    fn append(&mut self, line: &str) {
        let len = line.len() as u64;
        if self.target.file().is_some() && self.file_len + len > self.config.max_size_bytes {
            self.rotate();
        }

        loop {
            match &mut self.target {
                Target::Primary(w) | Target::Fallback(w) => {
                    if w.write_all(line.as_bytes()).is_ok() {
                        self.file_len += len;
                        self.sync_if_due();
                        return;
                    }
                    self.step_down();
                }
                Target::Stderr => {
                    eprint!("[GPI-JSONL] {line}");
                    return;
                }
                Target::Discard => return,
            }
        }
    }

    fn sync_if_due(&mut self) {
        if self.last_sync.elapsed() < self.config.sync_interval {
            return;
        }
        if let Some(w) = self.target.file() {
            let _ = w.flush();
            let _ = w.get_ref().sync_data();
        }
        self.last_sync = Instant::now();
    }

    fn open_fallback(&mut self) {
        let opened = self
            .config
            .fallback_path
            .as_deref()
            .map(|p| (p, open_append(p)));
        match opened {
            Some((path, Ok((file, len)))) => {
                eprintln!("[GPI-JSONL] writing run log to fallback {}", path.display());
                self.target = Target::Fallback(BufWriter::new(file));
                self.file_len = len;
            }
            Some((_, Err(e))) => {
                eprintln!("[GPI-JSONL] fallback unavailable ({e}), writing to stderr");
                self.target = Target::Stderr;
            }
            None => {
                eprintln!("[GPI-JSONL] no fallback configured, writing to stderr");
                self.target = Target::Stderr;
            }
        }
    }

    /// Move one link down the chain after a failed write.
    fn step_down(&mut self) {
        match self.target {
            Target::Primary(_) => self.open_fallback(),
            Target::Fallback(_) => {
                eprintln!("[GPI-JSONL] fallback write failed, writing to stderr");
                self.target = Target::Stderr;
            }
            Target::Stderr | Target::Discard => self.target = Target::Discard,
        }
    }

    fn current_path(&self) -> Option<PathBuf> {
        match self.target {
            Target::Primary(_) => Some(self.config.path.clone()),
            Target::Fallback(_) => self.config.fallback_path.clone(),
            Target::Stderr | Target::Discard => None,
        }
    }

    /// Shift `base.N-1` to `base.N` down to `base` to `base.1`, then reopen `base`.
    fn rotate(&mut self) {
        let Some(base) = self.current_path() else {
            return;
        };
        self.flush();

        let keep = self.config.max_rotated_files;
        if keep == 0 {
            let _ = fs::remove_file(&base);
        } else {
            let _ = fs::remove_file(rotated_name(&base, keep));
            for index in (1..keep).rev() {
                let _ = fs::rename(rotated_name(&base, index), rotated_name(&base, index + 1));
            }
            let _ = fs::rename(&base, rotated_name(&base, 1));
        }

        match open_append(&base) {
            Ok((file, len)) => {
                let writer = BufWriter::new(file);
                self.target = match self.target {
                    Target::Fallback(_) => Target::Fallback(writer),
                    _ => Target::Primary(writer),
                };
                self.file_len = len;
            }
            Err(e) => {
                eprintln!("[GPI-JSONL] cannot reopen {} after rotation: {e}", base.display());
                self.step_down();
            }
        }
    }
}

impl Drop for JsonlWriter {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Open or create a file for appending. Returns `(File, current_size)`.
fn open_append(path: &Path) -> Result<(File, u64)> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| IngestError::io(parent, source))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| IngestError::io(path, source))?;
    let size = file.metadata().map(|m| m.len()).unwrap_or(0);
    Ok((file, size))
}

/// `runs.jsonl` → `runs.jsonl.3`.
fn rotated_name(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

fn format_utc_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_at(path: PathBuf, max_size_bytes: u64) -> JsonlConfig {
        JsonlConfig {
            path,
            fallback_path: None,
            max_size_bytes,
            max_rotated_files: 3,
            sync_interval: Duration::from_secs(60),
        }
    }

    #[test]
    fn entries_are_separate_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");
        let mut writer = JsonlWriter::open(config_at(path.clone(), 1024 * 1024));

        let mut complete = LogEntry::new(EventType::RunComplete, Severity::Info);
        complete.source = Some("secondary".to_string());
        complete.rows = Some(12);
        writer.write_entry(&LogEntry::new(EventType::RunStart, Severity::Info));
        writer.write_entry(&complete);
        writer.flush();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "run_start");
        assert_eq!(lines[1]["event"], "run_complete");
        assert_eq!(lines[1]["source"], "secondary");
        assert_eq!(lines[1]["rows"], 12);
    }

    #[test]
    fn unset_fields_are_omitted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparse.jsonl");
        let mut writer = JsonlWriter::open(config_at(path.clone(), 1024 * 1024));
        writer.write_entry(&LogEntry::new(EventType::DaemonStart, Severity::Info));
        writer.flush();

        let line = fs::read_to_string(&path).unwrap();
        assert!(!line.contains("\"source\""));
        assert!(!line.contains("\"error_code\""));
        assert!(line.contains("\"severity\":\"info\""));
    }

    #[test]
    fn rotation_keeps_bounded_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rot.jsonl");
        let mut writer = JsonlWriter::open(config_at(path.clone(), 100));

        for _ in 0..10 {
            writer.write_entry(&LogEntry::new(EventType::RunSkipped, Severity::Warning));
        }
        writer.flush();

        assert!(path.exists());
        assert!(rotated_name(&path, 1).exists());
        assert!(rotated_name(&path, 3).exists());
        assert!(!rotated_name(&path, 4).exists());
        assert_eq!(writer.state(), "primary");
    }

    #[test]
    fn falls_back_when_primary_unwritable() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file cannot be a parent directory.
        let blocker = dir.path().join("not_a_dir");
        fs::write(&blocker, b"x").unwrap();
        let fallback = dir.path().join("fallback.jsonl");
        let mut config = config_at(blocker.join("runs.jsonl"), 1024 * 1024);
        config.fallback_path = Some(fallback.clone());

        let mut writer = JsonlWriter::open(config);
        assert_eq!(writer.state(), "fallback");
        writer.write_entry(&LogEntry::new(EventType::RunFailed, Severity::Critical));
        writer.flush();
        assert!(!fs::read_to_string(&fallback).unwrap().is_empty());
    }

    #[test]
    fn stderr_when_nothing_is_writable() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let writer = JsonlWriter::open(config_at(blocker.join("runs.jsonl"), 1024));
        assert_eq!(writer.state(), "stderr");
    }

    #[test]
    fn entry_roundtrips_through_serde() {
        let mut entry = LogEntry::new(EventType::SourceFailover, Severity::Warning);
        entry.error_code = Some("GPI-2001".to_string());
        let json = serde_json::to_string(&entry).unwrap();
        let back: LogEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
