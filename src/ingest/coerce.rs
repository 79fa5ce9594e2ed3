//! Per-field parse functions with an explicit three-way outcome.

#![allow(missing_docs)]

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

/// Outcome of coercing one optional wire field.
#[derive(Debug, Clone, PartialEq)]
pub enum Coerced<T> {
    Value(T),
    /// Field missing or JSON `null`.
    Absent,
    /// Field present but not convertible; carries a short reason.
    Invalid(String),
}

impl<T> Coerced<T> {
    /// Collapse to an option, treating invalid input like absence.
    pub fn or_null(self) -> Option<T> {
        match self {
            Self::Value(value) => Some(value),
            Self::Absent | Self::Invalid(_) => None,
        }
    }

    pub const fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid(_))
    }
}

fn describe(value: &Value) -> String {
    let mut text = value.to_string();
    if text.len() > 40 {
        let mut cut = 40;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("...");
    }
    text
}

/// Integer identifier. Floats truncate toward zero; numeric strings parse.
pub fn integer_id(value: Option<&Value>) -> Coerced<i64> {
    integer(value)
}

/// Integer field such as `course`.
pub fn integer(value: Option<&Value>) -> Coerced<i64> {
    let Some(value) = value else {
        return Coerced::Absent;
    };
    match value {
        Value::Null => Coerced::Absent,
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(truncate))
            .map_or_else(|| Coerced::Invalid(format!("integer out of range: {n}")), Coerced::Value),
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| trimmed.parse::<f64>().ok().filter(|f| f.is_finite()).map(truncate))
                .map_or_else(|| Coerced::Invalid(format!("not an integer: {s:?}")), Coerced::Value)
        }
        Value::Bool(b) => Coerced::Value(i64::from(*b)),
        other => Coerced::Invalid(format!("not an integer: {}", describe(other))),
    }
}

#[allow(clippy::cast_possible_truncation)]
fn truncate(value: f64) -> i64 {
    // `as` saturates at the i64 bounds.
    value.trunc() as i64
}

/// Decimal field (`latitude`, `speed`, ...). Non-finite values are invalid.
pub fn decimal(value: Option<&Value>) -> Coerced<f64> {
    let Some(value) = value else {
        return Coerced::Absent;
    };
    let parsed = match value {
        Value::Null => return Coerced::Absent,
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        other => return Coerced::Invalid(format!("not a number: {}", describe(other))),
    };
    match parsed {
        Some(f) if f.is_finite() => Coerced::Value(f),
        _ => Coerced::Invalid(format!("not a finite number: {}", describe(value))),
    }
}

/// Truthiness for the `valid` flag.
pub fn boolean(value: Option<&Value>) -> Coerced<bool> {
    let Some(value) = value else {
        return Coerced::Absent;
    };
    match value {
        Value::Null => Coerced::Absent,
        Value::Bool(b) => Coerced::Value(*b),
        Value::Number(n) => Coerced::Value(n.as_f64().is_some_and(|f| f != 0.0)),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Coerced::Value(true),
            "false" | "0" | "no" | "off" | "" => Coerced::Value(false),
            _ => Coerced::Invalid(format!("not a boolean: {s:?}")),
        },
        other => Coerced::Invalid(format!("not a boolean: {}", describe(other))),
    }
}

/// Timestamp in any of the formats providers are known to emit.
///
/// Offsets are honored; naive timestamps are taken as UTC. Empty strings
/// count as absent.
pub fn timestamp(value: Option<&Value>) -> Coerced<DateTime<Utc>> {
    let Some(value) = value else {
        return Coerced::Absent;
    };
    let text = match value {
        Value::Null => return Coerced::Absent,
        Value::String(s) if s.trim().is_empty() => return Coerced::Absent,
        Value::String(s) => s.trim(),
        other => return Coerced::Invalid(format!("not a timestamp: {}", describe(other))),
    };

    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Coerced::Value(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = DateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Coerced::Value(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Coerced::Value(naive.and_utc());
        }
    }
    Coerced::Invalid(format!("unparsable timestamp: {text:?}"))
}

/// Canonical text for the opaque attribute bag.
///
/// Always valid JSON: a string bag keeps its quotes, so `"{\"a\":1}"` and
/// `{"a":1}` stay distinguishable. Object keys serialize in sorted order, so
/// equal bags produce equal text.
pub fn attributes(value: Option<&Value>) -> Option<String> {
    match value {
        None | Some(Value::Null) => None,
        Some(other) => Some(other.to_string()),
    }
}

/// Free-text address; non-string JSON keeps its textual form.
pub fn address(value: Option<&Value>) -> Option<String> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    }
}
