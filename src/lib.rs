#![forbid(unsafe_code)]

//! GPS telemetry ingestion (gpsi): poll upstream tracking providers and keep a
//! durable position history plus a latest-position-per-device projection.
//!
//! One run flows strictly through four stages:
//! 1. **Fetch**: primary (cache) provider, failing over to the secondary
//!    (authoritative) provider
//! 2. **Normalize**: coerce raw records, discarding ones without usable identity
//! 3. **Reduce**: one latest candidate per device, by fix time
//! 4. **Persist**: chunked idempotent upserts into SQLite
//!
//! # Library usage
//!
//! ```rust,no_run
//! use gps_ingest::prelude::*;
//!
//! # fn main() -> gps_ingest::core::errors::Result<()> {
//! let config = Config::load(None)?;
//! let store = PositionStore::open(
//!     &config.paths.sqlite_db,
//!     config.store.chunk_size,
//!     config.store.latest_policy,
//! )?;
//! let mut runner = PipelineRunner::new(SourceFetcher::from_config(&config)?, store);
//! let outcome = runner.run(RunRequest::default(), &mut NullSink);
//! println!("{}", outcome.summary_line());
//! # Ok(())
//! # }
//! ```

pub mod prelude;

pub mod core;
pub mod ingest;
pub mod logger;
pub mod pipeline;
pub mod source;
pub mod store;
