//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use gps_ingest::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{IngestError, Result, UpstreamError, UpstreamFailure};

// Sources
pub use crate::source::fetcher::{FetchOutcome, SourceFetcher};
pub use crate::source::http::HttpSource;
pub use crate::source::raw::RawRecord;
pub use crate::source::{SourceKind, SourcePreference, TelemetrySource};

// Ingest
pub use crate::ingest::{DeviceLatestRecord, PositionRecord, normalize, reduce_latest};

// Store
pub use crate::store::{HistoryQuery, LatestWritePolicy, PositionSink, PositionStore};

// Pipeline
pub use crate::pipeline::{PipelineRunner, RunLock, RunOutcome, RunRequest, RunStatus};

// Logging
pub use crate::logger::jsonl::{JsonlConfig, JsonlWriter};
pub use crate::logger::{EventSink, NullSink};
