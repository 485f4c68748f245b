//! TTL label value parsing
//!
//! The TTL label carries either a relative duration, counted from the
//! object's creation time, or an absolute timestamp. Parsing is attempted
//! in that order: duration, ISO-8601 instant, date. Values are matched
//! exactly - no trimming, no partial parses.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use thiserror::Error;

/// Instant form with separators, e.g. `2024-05-01T15:04:05Z`
const INSTANT_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Compact instant form without time separators, e.g. `2024-05-01T150405Z`.
/// Accepted for compatibility with labels written against earlier releases.
const INSTANT_FORMAT_COMPACT: &str = "%Y-%m-%dT%H%M%SZ";

/// Date-only form, interpreted as midnight UTC
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Why a TTL label value could not be turned into a deadline
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TtlParseError {
    /// The value matches none of the supported forms
    #[error("not a duration, instant, or date")]
    Unrecognized,

    /// The value parsed as a duration but the resulting deadline is not
    /// representable
    #[error("duration overflows the representable time range")]
    OutOfRange,
}

/// Compute the absolute deadline encoded by a TTL label value (pure function).
///
/// A duration value yields `created + duration`; a zero duration makes the
/// object immediately eligible for deletion. Instant and date values are
/// absolute and ignore `created`. Anything else, including negative
/// durations and padded values, is an error - callers log and ignore such
/// objects rather than retry them.
pub fn deadline(value: &str, created: DateTime<Utc>) -> Result<DateTime<Utc>, TtlParseError> {
    if let Ok(duration) = humantime::parse_duration(value) {
        let duration =
            chrono::Duration::from_std(duration).map_err(|_| TtlParseError::OutOfRange)?;
        return created
            .checked_add_signed(duration)
            .ok_or(TtlParseError::OutOfRange);
    }

    if let Ok(instant) = NaiveDateTime::parse_from_str(value, INSTANT_FORMAT) {
        return Ok(instant.and_utc());
    }
    if let Ok(instant) = NaiveDateTime::parse_from_str(value, INSTANT_FORMAT_COMPACT) {
        return Ok(instant.and_utc());
    }

    if let Ok(date) = NaiveDate::parse_from_str(value, DATE_FORMAT) {
        return Ok(date.and_time(NaiveTime::MIN).and_utc());
    }

    Err(TtlParseError::Unrecognized)
}
