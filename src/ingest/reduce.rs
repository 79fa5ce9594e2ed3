//! Per-device latest-position reduction over one batch.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ingest::normalize::PositionRecord;

/// One row of the latest projection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceLatestRecord {
    pub device_id: i64,
    pub last_external_id: i64,
    pub fix_time: Option<DateTime<Utc>>,
    pub server_time: Option<DateTime<Utc>>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub course: Option<i64>,
    pub valid: bool,
    pub address: Option<String>,
    pub attributes: Option<String>,
}

impl From<&PositionRecord> for DeviceLatestRecord {
    fn from(record: &PositionRecord) -> Self {
        Self {
            device_id: record.device_id,
            last_external_id: record.external_id,
            fix_time: record.fix_time,
            server_time: record.server_time,
            latitude: record.latitude,
            longitude: record.longitude,
            altitude: record.altitude,
            speed: record.speed,
            course: record.course,
            valid: record.valid,
            address: record.address.clone(),
            attributes: record.attributes.clone(),
        }
    }
}

/// Whether `incoming` should replace the current candidate.
///
/// A timestamp beats no timestamp; otherwise only a strictly later fix wins.
fn supersedes(current: Option<DateTime<Utc>>, incoming: Option<DateTime<Utc>>) -> bool {
    match (current, incoming) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(current), Some(incoming)) => incoming > current,
    }
}

/// Fold a batch into one latest candidate per device.
///
/// Walks the batch in order; ties and all-null timestamps keep the first
/// record seen for the device. Nothing outside the batch is consulted.
#[must_use]
pub fn reduce_latest(records: &[PositionRecord]) -> BTreeMap<i64, DeviceLatestRecord> {
    let mut best: BTreeMap<i64, &PositionRecord> = BTreeMap::new();
    for record in records {
        best.entry(record.device_id)
            .and_modify(|current| {
                if supersedes(current.fix_time, record.fix_time) {
                    *current = record;
                }
            })
            .or_insert(record);
    }
    best.into_iter()
        .map(|(device_id, record)| (device_id, DeviceLatestRecord::from(record)))
        .collect()
}
