//! Upstream wire shape and payload shape detection.
//!
//! Every field is kept as an untyped JSON value: providers disagree on whether
//! ids are numbers or strings, and coercion policy belongs to the normalizer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One position exactly as a provider sent it. No uniqueness is assumed.
///
/// A JSON `null` and a missing key both deserialize to `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawRecord {
    /// Provider-side position id (`id`).
    pub id: Option<Value>,
    /// `deviceId`.
    pub device_id: Option<Value>,
    /// `fixTime`: when the device measured the position.
    pub fix_time: Option<Value>,
    /// `serverTime`: when the provider received it.
    pub server_time: Option<Value>,
    pub latitude: Option<Value>,
    pub longitude: Option<Value>,
    pub altitude: Option<Value>,
    pub speed: Option<Value>,
    pub course: Option<Value>,
    pub valid: Option<Value>,
    pub address: Option<Value>,
    /// Opaque provider attribute bag.
    pub attributes: Option<Value>,
}

/// Pull the record list out of a decoded response body.
///
/// Accepts a bare array or an object with a `positions` array. Any other shape
/// returns `None`. Array elements that are not JSON objects are dropped.
#[must_use]
pub fn extract_records(payload: Value) -> Option<Vec<RawRecord>> {
    let items = match payload {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("positions") {
            Some(Value::Array(items)) => items,
            _ => return None,
        },
        _ => return None,
    };

    Some(
        items
            .into_iter()
            .filter(Value::is_object)
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect(),
    )
}
