//! Timestamp parsing and storage formatting.
//!
//! Observations arrive with loosely formatted times (scrapers send whatever
//! their runtime prints), so [`parse_timestamp`] accepts a handful of common
//! shapes. Stored timestamps always use one fixed-width RFC 3339 form so that
//! text comparison in SQLite orders chronologically.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, SecondsFormat, SubsecRound, Utc};

use crate::{Result, SpotterError};

const NAIVE_FORMATS: [&str; 3] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// Shorter digit runs are dates (`YYYYMMDD`) or noise, not unix seconds.
const MIN_UNIX_DIGITS: usize = 9;

/// Drop precision below what the store persists (microseconds).
pub fn normalize(t: DateTime<Utc>) -> DateTime<Utc> {
    t.trunc_subsecs(6)
}

/// Fixed-width storage form: `YYYY-MM-DDTHH:MM:SS.ffffffZ`.
pub fn format_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp written by [`format_timestamp`].
pub fn parse_stored_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SpotterError::Storage(format!("corrupt stored timestamp {s:?}: {e}")))
}

/// Reject times [`format_timestamp`] cannot write as a four-digit year.
///
/// Anything outside years 0000-9999 would break the fixed-width storage form
/// and with it text ordering and [`parse_stored_timestamp`].
pub fn ensure_storable(t: DateTime<Utc>) -> Result<DateTime<Utc>> {
    if (0..=9999).contains(&t.year()) {
        Ok(t)
    } else {
        Err(SpotterError::Validation(format!(
            "timestamp {} is outside years 0000-9999",
            t.to_rfc3339_opts(SecondsFormat::Secs, true)
        )))
    }
}

/// Parse a caller-supplied timestamp.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.f]` (with or without `T`, read as
/// UTC), `YYYY-MM-DD HH:MM`, a bare `YYYY-MM-DD` or `YYYYMMDD`, or unix
/// seconds of nine or more digits. The result is always storable.
pub fn parse_timestamp(input: &str) -> Result<DateTime<Utc>> {
    let s = input.trim();
    if s.is_empty() {
        return Err(SpotterError::Validation("empty timestamp".to_string()));
    }
    parse_any(s)
        .ok_or_else(|| SpotterError::Validation(format!("unrecognised timestamp {s:?}")))
        .and_then(ensure_storable)
}

fn parse_any(s: &str) -> Option<DateTime<Utc>> {
    if s.bytes().all(|b| b.is_ascii_digit()) {
        return match s.len() {
            8 => NaiveDate::parse_from_str(s, "%Y%m%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|t| t.and_utc()),
            n if n >= MIN_UNIX_DIGITS => s
                .parse::<i64>()
                .ok()
                .and_then(|secs| DateTime::from_timestamp(secs, 0)),
            _ => None,
        };
    }

    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    if let Ok(t) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(t.with_timezone(&Utc));
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(t.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn accepts_common_shapes() {
        let expected = dt("2024-03-01T12:30:00Z");
        for input in [
            "2024-03-01T12:30:00Z",
            "2024-03-01T14:30:00+02:00",
            "2024-03-01 12:30:00",
            "2024-03-01T12:30:00",
            "2024-03-01 12:30",
            " 2024-03-01 12:30:00 ",
            "1709296200",
        ] {
            assert_eq!(parse_timestamp(input).unwrap(), expected, "input {input:?}");
        }
        assert_eq!(
            parse_timestamp("2024-03-01").unwrap(),
            dt("2024-03-01T00:00:00Z")
        );
    }

    #[test]
    fn eight_digits_read_as_a_compact_date() {
        assert_eq!(
            parse_timestamp("20240301").unwrap(),
            dt("2024-03-01T00:00:00Z")
        );
        assert!(parse_timestamp("20241399").unwrap_err().is_validation());
        assert!(parse_timestamp("1234567").unwrap_err().is_validation());
        assert_eq!(
            parse_timestamp("100000000").unwrap(),
            dt("1973-03-03T09:46:40Z")
        );
    }

    #[test]
    fn rejects_times_outside_four_digit_years() {
        for input in ["300000000000", "-0001-01-01T00:00:00Z", "+10000-01-01T00:00:00Z"] {
            let err = parse_timestamp(input).unwrap_err();
            assert!(err.is_validation(), "input {input:?} gave {err:?}");
        }
        assert!(parse_timestamp("253402300799").is_ok());
        assert!(parse_timestamp("253402300800").unwrap_err().is_validation());
    }

    #[test]
    fn ensure_storable_keeps_the_storage_form_fixed_width() {
        let last = dt("9999-12-31T23:59:59.999999Z");
        assert_eq!(ensure_storable(last).unwrap(), last);
        assert_eq!(format_timestamp(last).len(), 27);
        let past = last + chrono::TimeDelta::microseconds(1);
        assert!(ensure_storable(past).unwrap_err().is_validation());
    }

    #[test]
    fn keeps_fractional_seconds() {
        let t = parse_timestamp("2024-03-01 12:30:00.250").unwrap();
        assert_eq!(t, dt("2024-03-01T12:30:00.250Z"));
    }

    #[test]
    fn rejects_garbage_as_validation_error() {
        for input in ["", "yesterday", "2024-13-45", "12"] {
            let err = parse_timestamp(input).unwrap_err();
            assert!(
                matches!(err, SpotterError::Validation(_)),
                "input {input:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn storage_format_is_fixed_width_and_sortable() {
        let a = format_timestamp(dt("2024-01-01T00:00:00Z"));
        let b = format_timestamp(dt("2024-01-01T00:00:00.5Z"));
        let c = format_timestamp(dt("2024-01-01T00:00:01Z"));
        assert_eq!(a, "2024-01-01T00:00:00.000000Z");
        assert_eq!(a.len(), b.len());
        assert!(a < b && b < c);
        assert_eq!(parse_stored_timestamp(&b).unwrap(), dt("2024-01-01T00:00:00.5Z"));
    }

    #[test]
    fn normalize_truncates_to_micros() {
        let t = dt("2024-01-01T00:00:00.123456789Z");
        assert_eq!(normalize(t), dt("2024-01-01T00:00:00.123456Z"));
    }
}
