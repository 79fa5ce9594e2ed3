//! Run-event logging: JSONL append-only with graceful degradation.

pub mod jsonl;

use jsonl::{JsonlWriter, LogEntry};

/// Destination for run events. Emitting never fails.
pub trait EventSink {
    fn emit(&mut self, entry: &LogEntry);
}

impl EventSink for JsonlWriter {
    fn emit(&mut self, entry: &LogEntry) {
        self.write_entry(entry);
        self.flush();
    }
}

/// In-memory capture, handy for tests and dry runs.
impl EventSink for Vec<LogEntry> {
    fn emit(&mut self, entry: &LogEntry) {
        self.push(entry.clone());
    }
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&mut self, _entry: &LogEntry) {}
}
