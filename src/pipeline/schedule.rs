//! Fixed-period daemon loop with single-flight and skip-not-queue semantics.

#![allow(missing_docs)]

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use crate::core::errors::IngestError;
use crate::logger::EventSink;
use crate::logger::jsonl::{EventType, LogEntry, Severity};
use crate::pipeline::lock::RunLock;
use crate::pipeline::runner::{PipelineRunner, RunOutcome, RunRequest};
use crate::store::PositionSink;

/// Longest uninterrupted sleep, so shutdown is noticed promptly.
const SLEEP_SLICE: Duration = Duration::from_millis(250);

/// Period boundaries anchored at the daemon start.
#[derive(Debug, Clone, Copy)]
pub struct Ticker {
    period: Duration,
    next: Instant,
}

impl Ticker {
    /// First tick fires immediately at `start`.
    pub fn starting_at(start: Instant, period: Duration) -> Self {
        Self {
            period: period.max(Duration::from_millis(1)),
            next: start,
        }
    }

    pub fn next_deadline(&self) -> Instant {
        self.next
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Advance past a tick that just ran, finishing at `now`.
    ///
    /// The next deadline becomes the first boundary strictly after `now`;
    /// boundaries that passed while the run was in progress are dropped.
    /// Returns how many were dropped.
    pub fn schedule_after(&mut self, now: Instant) -> u64 {
        self.next += self.period;
        let mut skipped = 0;
        while self.next <= now {
            self.next += self.period;
            skipped += 1;
        }
        skipped
    }
}

/// Run ticks until `should_stop` returns true.
///
/// Each tick tries the run lock without blocking. If another process holds it
/// the tick is skipped and logged; it is never retried or queued. `on_outcome`
/// sees every tick's outcome, including skipped ones.
pub fn run_daemon<S, F, O>(
    runner: &mut PipelineRunner<S>,
    request: RunRequest,
    lock_path: &Path,
    period: Duration,
    events: &mut dyn EventSink,
    should_stop: F,
    mut on_outcome: O,
) where
    S: PositionSink,
    F: Fn() -> bool,
    O: FnMut(&RunOutcome),
{
    let mut start = LogEntry::new(EventType::DaemonStart, Severity::Info);
    start.details = Some(format!(
        "interval_secs={} preference={}",
        period.as_secs(),
        request.preference.as_str()
    ));
    events.emit(&start);

    let mut ticker = Ticker::starting_at(Instant::now(), period);
    let mut ticks: u64 = 0;
    let mut dropped: u64 = 0;

    'daemon: loop {
        while Instant::now() < ticker.next_deadline() {
            if should_stop() {
                break 'daemon;
            }
            let remaining = ticker.next_deadline().saturating_duration_since(Instant::now());
            thread::sleep(remaining.min(SLEEP_SLICE));
        }
        if should_stop() {
            break;
        }

        ticks += 1;
        let outcome = match RunLock::try_acquire(lock_path) {
            Ok(_lock) => runner.run(request, events),
            Err(err @ IngestError::LockBusy { .. }) => {
                let outcome = RunOutcome::skipped(request, runner.now(), &err);
                events.emit(&outcome.log_entry());
                outcome
            }
            Err(err) => {
                eprintln!("[GPI-DAEMON] cannot take run lock: {err}");
                let outcome = RunOutcome::failed(request, runner.now(), &err);
                events.emit(&outcome.log_entry());
                outcome
            }
        };
        on_outcome(&outcome);

        let missed = ticker.schedule_after(Instant::now());
        if missed > 0 {
            dropped += missed;
            let mut entry = LogEntry::new(EventType::RunSkipped, Severity::Warning);
            entry.details = Some(format!("missed_ticks={missed} reason=run_overran_period"));
            events.emit(&entry);
        }
    }

    let mut stop = LogEntry::new(EventType::DaemonStop, Severity::Info);
    stop.details = Some(format!("ticks={ticks} dropped_ticks={dropped}"));
    events.emit(&stop);
}
