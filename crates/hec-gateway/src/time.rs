// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Resolution of an event's `time` field.
//!
//! Events may carry their time as an integer, a fractional number, a numeric string, or not at
//! all. The resolver turns any of these into an integer instant and records whether the value
//! came from the client (`reported`) or was filled in from the caller's default (`generated`).
//!
//! The caller picks the default. Batches chain it: each event defaults to the previous event's
//! resolved instant, so a run of events without `time` inherits the last reported one.
//!
//! Known ambiguity: the text `"0"` resolves exactly like unparseable text, to the default with
//! `generated` provenance. This is kept as-is for compatibility with existing clients.

use serde_json::Value;

/// Where a resolved instant came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSource {
    /// Taken from the event itself.
    Reported,
    /// Filled in from the caller supplied default.
    Generated,
}

impl TimeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reported => "reported",
            Self::Generated => "generated",
        }
    }
}

impl std::fmt::Display for TimeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedTime {
    pub instant: i64,
    /// `true` when the event supplied a usable time value.
    pub parsed: bool,
    pub source: TimeSource,
}

impl ResolvedTime {
    fn reported(instant: i64) -> Self {
        Self {
            instant,
            parsed: true,
            source: TimeSource::Reported,
        }
    }

    fn generated(default: i64) -> Self {
        Self {
            instant: default,
            parsed: false,
            source: TimeSource::Generated,
        }
    }
}

/// Resolves the raw `time` value of one event, falling back to `default`.
///
/// Resolution order, first match wins:
/// 1. absent, `null`, empty text or a structured value: default
/// 2. fractional number: the decimal point is dropped from its shortest decimal form
///    (`1426279439.123` becomes `1426279439123`)
/// 3. integer: used verbatim
/// 4. text: parsed as a number, a zero or unparseable result gives the default
/// 5. anything else: default
pub fn resolve_timestamp(raw: Option<&Value>, default: i64) -> ResolvedTime {
    let value = match raw {
        None | Some(Value::Null) => return ResolvedTime::generated(default),
        Some(value) => value,
    };

    match value {
        Value::Number(number) if number.is_f64() => match number.as_f64().and_then(strip_decimal) {
            Some(instant) => ResolvedTime::reported(instant),
            None => ResolvedTime::generated(default),
        },
        Value::Number(number) => match number.as_i64() {
            Some(instant) => ResolvedTime::reported(instant),
            None => ResolvedTime::generated(default),
        },
        Value::String(text) => match parse_text(text) {
            Some(instant) if instant != 0 => ResolvedTime::reported(instant),
            _ => ResolvedTime::generated(default),
        },
        _ => ResolvedTime::generated(default),
    }
}

/// Drops the decimal point of the shortest round-trip representation of `value`.
///
/// Values whose representation needs an exponent, or whose digits overflow an `i64`, yield
/// `None`.
fn strip_decimal(value: f64) -> Option<i64> {
    if !value.is_finite() {
        return None;
    }
    let digits: String = format!("{value:?}").chars().filter(|c| *c != '.').collect();
    digits.parse::<i64>().ok()
}

/// Lenient numeric conversion of a textual time value.
///
/// Whitespace is trimmed, decimal text is truncated toward zero.
fn parse_text(text: &str) -> Option<i64> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(instant) = trimmed.parse::<i64>() {
        return Some(instant);
    }
    match trimmed.parse::<f64>() {
        #[allow(clippy::cast_possible_truncation)]
        Ok(value) if value.is_finite() && value.abs() < i64::MAX as f64 => Some(value as i64),
        _ => None,
    }
}
