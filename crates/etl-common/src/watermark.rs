//! Watermark helpers
//!
//! A watermark is stored as an opaque string. Timestamp watermarks are
//! RFC 3339 instants; id watermarks are compared numerically when both sides
//! are numbers and lexicographically otherwise. Integer ids compare exactly at
//! any width.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use std::cmp::Ordering;

/// Parse a timestamp in any of the formats sources commonly emit.
///
/// Accepts RFC 3339 (`2024-01-02T03:04:05Z`, with offset or fractional
/// seconds), naive date-times assumed UTC (`2024-01-02T03:04:05`,
/// `2024-01-02 03:04:05`), plain dates, and RFC 2822 as used by RSS.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }

    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Render an instant the way timestamp watermarks are stored.
pub fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Order two record ids.
pub fn compare_ids(a: &str, b: &str) -> Ordering {
    let (a, b) = (a.trim(), b.trim());

    if let (Ok(x), Ok(y)) = (a.parse::<i128>(), b.parse::<i128>()) {
        return x.cmp(&y);
    }
    if let (Some(x), Some(y)) = (unsigned_digits(a), unsigned_digits(b)) {
        return x.len().cmp(&y.len()).then_with(|| x.cmp(y));
    }

    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) if x.is_finite() && y.is_finite() => {
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        },
        _ => a.cmp(b),
    }
}

/// Digits of an unsigned integer literal without leading zeros.
fn unsigned_digits(value: &str) -> Option<&str> {
    (!value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()))
        .then(|| value.trim_start_matches('0'))
}

/// Whether `candidate` lies strictly past the id watermark.
pub fn id_exceeds(candidate: &str, watermark: &str) -> bool {
    compare_ids(candidate, watermark) == Ordering::Greater
}
