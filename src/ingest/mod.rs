//! Record normalization and per-device reduction. Pure functions, no IO.

#![allow(missing_docs)]

pub mod coerce;
pub mod normalize;
pub mod reduce;

pub use normalize::{DiscardReason, NormalizedBatch, PositionRecord, normalize, normalize_batch};
pub use reduce::{DeviceLatestRecord, reduce_latest};
