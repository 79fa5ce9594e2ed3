//! Raw record validation into the canonical history shape.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ingest::coerce::{self, Coerced};
use crate::source::raw::RawRecord;

/// Canonical position row. `external_id` is the natural key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionRecord {
    pub external_id: i64,
    pub device_id: i64,
    pub fix_time: Option<DateTime<Utc>>,
    pub server_time: Option<DateTime<Utc>>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub course: Option<i64>,
    pub valid: bool,
    pub address: Option<String>,
    /// Canonical JSON text of the provider attribute bag.
    pub attributes: Option<String>,
}

/// Why a raw record was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    /// `id` missing, non-numeric, or not positive.
    InvalidExternalId,
    /// `deviceId` missing, non-numeric, or not positive.
    InvalidDeviceId,
    UnparsableFixTime,
    UnparsableServerTime,
}

impl DiscardReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidExternalId => "invalid_external_id",
            Self::InvalidDeviceId => "invalid_device_id",
            Self::UnparsableFixTime => "unparsable_fix_time",
            Self::UnparsableServerTime => "unparsable_server_time",
        }
    }
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn positive_id(coerced: Coerced<i64>) -> Option<i64> {
    match coerced {
        Coerced::Value(id) if id > 0 => Some(id),
        _ => None,
    }
}

fn optional_time(coerced: Coerced<DateTime<Utc>>) -> Result<Option<DateTime<Utc>>, ()> {
    match coerced {
        Coerced::Value(ts) => Ok(Some(ts)),
        Coerced::Absent => Ok(None),
        Coerced::Invalid(_) => Err(()),
    }
}

/// Validate one raw record.
///
/// Identity and timestamp problems discard the record. A bad numeric field is
/// stored as null and a bad `valid` flag reads as `true`, so one odd sensor
/// value never loses the fix.
pub fn normalize(raw: &RawRecord) -> Result<PositionRecord, DiscardReason> {
    let external_id =
        positive_id(coerce::integer_id(raw.id.as_ref())).ok_or(DiscardReason::InvalidExternalId)?;
    let device_id = positive_id(coerce::integer_id(raw.device_id.as_ref()))
        .ok_or(DiscardReason::InvalidDeviceId)?;
    let fix_time = optional_time(coerce::timestamp(raw.fix_time.as_ref()))
        .map_err(|()| DiscardReason::UnparsableFixTime)?;
    let server_time = optional_time(coerce::timestamp(raw.server_time.as_ref()))
        .map_err(|()| DiscardReason::UnparsableServerTime)?;

    let valid = match coerce::boolean(raw.valid.as_ref()) {
        Coerced::Value(flag) => flag,
        Coerced::Absent | Coerced::Invalid(_) => true,
    };

    Ok(PositionRecord {
        external_id,
        device_id,
        fix_time,
        server_time,
        latitude: coerce::decimal(raw.latitude.as_ref()).or_null(),
        longitude: coerce::decimal(raw.longitude.as_ref()).or_null(),
        altitude: coerce::decimal(raw.altitude.as_ref()).or_null(),
        speed: coerce::decimal(raw.speed.as_ref()).or_null(),
        course: coerce::integer(raw.course.as_ref()).or_null(),
        valid,
        address: coerce::address(raw.address.as_ref()),
        attributes: coerce::attributes(raw.attributes.as_ref()),
    })
}

/// A normalized batch with discard accounting.
#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    /// Accepted records, in input order.
    pub records: Vec<PositionRecord>,
    pub discarded: usize,
    pub discard_reasons: BTreeMap<DiscardReason, usize>,
}

/// Normalize every record, keeping input order for the accepted ones.
#[must_use]
pub fn normalize_batch(raw: &[RawRecord]) -> NormalizedBatch {
    let mut batch = NormalizedBatch {
        records: Vec::with_capacity(raw.len()),
        ..NormalizedBatch::default()
    };
    for record in raw {
        match normalize(record) {
            Ok(position) => batch.records.push(position),
            Err(reason) => {
                batch.discarded += 1;
                *batch.discard_reasons.entry(reason).or_insert(0) += 1;
            }
        }
    }
    batch
}
