//! Run orchestration, single-flight locking, and the periodic daemon loop.

pub mod lock;
pub mod runner;
pub mod schedule;
#[cfg(feature = "daemon")]
pub mod signals;

pub use lock::RunLock;
pub use runner::{PipelineRunner, RunOutcome, RunPhase, RunRequest, RunStatus};
pub use schedule::{Ticker, run_daemon};
