use std::sync::OnceLock;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%A, %B %d, %Y at %I:%M %p",
    "%B %d, %Y at %I:%M %p",
    "%d %B %Y at %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%B %d, %Y", "%d %B %Y", "%b %d, %Y"];

fn relative_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(
            r"^(\d+|an?)\s*(s|secs?|seconds?|m|mins?|minutes?|h|hrs?|hours?|d|days?|w|wks?|weeks?)(?:\s+ago)?$",
        )
        .expect("valid regex")
    })
}

fn epoch_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^(\d{10}|\d{13})$").expect("valid regex"))
}

/// Converts a feed timestamp into an absolute instant.
///
/// Relative expressions resolve against `captured_at`. Anything that cannot
/// be pinned down without guessing (month or year offsets, "Yesterday at",
/// dates without a year) yields `None`; the raw text stays on the record.
pub fn normalize_timestamp(raw: &str, captured_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lowered = trimmed.to_lowercase();
    if lowered == "just now" || lowered == "now" {
        return Some(captured_at);
    }
    if let Some(captures) = relative_regex().captures(&lowered) {
        let amount: i64 = match &captures[1] {
            "a" | "an" => 1,
            digits => digits.parse().ok()?,
        };
        let unit = &captures[2];
        // Out-of-range amounts come straight from page text.
        let offset = match unit.chars().next()? {
            's' => Duration::try_seconds(amount),
            'm' => Duration::try_minutes(amount),
            'h' => Duration::try_hours(amount),
            'd' => Duration::try_days(amount),
            'w' => Duration::try_weeks(amount),
            _ => None,
        }?;
        return captured_at.checked_sub_signed(offset);
    }
    if epoch_regex().is_match(trimmed) {
        let value: i64 = trimmed.parse().ok()?;
        return if trimmed.len() == 13 {
            Utc.timestamp_millis_opt(value).single()
        } else {
            Utc.timestamp_opt(value, 0).single()
        };
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(Utc.from_utc_datetime(&parsed));
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return date.and_hms_opt(0, 0, 0).map(|naive| Utc.from_utc_datetime(&naive));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn captured() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn relative_expressions_resolve_against_capture_time() {
        let now = captured();
        assert_eq!(normalize_timestamp("Just now", now), Some(now));
        assert_eq!(normalize_timestamp("5m", now), Some(now - Duration::minutes(5)));
        assert_eq!(normalize_timestamp("2h", now), Some(now - Duration::hours(2)));
        assert_eq!(normalize_timestamp("2 hours ago", now), Some(now - Duration::hours(2)));
        assert_eq!(normalize_timestamp("3 days ago", now), Some(now - Duration::days(3)));
        assert_eq!(normalize_timestamp("1w", now), Some(now - Duration::weeks(1)));
        assert_eq!(normalize_timestamp("an hour ago", now), Some(now - Duration::hours(1)));
        assert_eq!(normalize_timestamp("45 mins", now), Some(now - Duration::minutes(45)));
    }

    #[test]
    fn absolute_dates_with_a_year_are_parsed() {
        let now = captured();
        assert_eq!(
            normalize_timestamp("Tuesday, March 12, 2024 at 10:15 AM", now),
            Some(Utc.with_ymd_and_hms(2024, 3, 12, 10, 15, 0).unwrap())
        );
        assert_eq!(
            normalize_timestamp("January 20, 2023", now),
            Some(Utc.with_ymd_and_hms(2023, 1, 20, 0, 0, 0).unwrap())
        );
        assert_eq!(
            normalize_timestamp("2024-02-29T08:30:00Z", now),
            Some(Utc.with_ymd_and_hms(2024, 2, 29, 8, 30, 0).unwrap())
        );
        assert_eq!(
            normalize_timestamp("1700000000", now),
            Some(Utc.with_ymd_and_hms(2023, 11, 14, 22, 13, 20).unwrap())
        );
    }

    #[test]
    fn ambiguous_expressions_stay_unset() {
        let now = captured();
        for raw in ["Yesterday at 5:00 PM", "March 10", "3mo", "2 months ago", "1y", "", "Sponsored"] {
            assert_eq!(normalize_timestamp(raw, now), None, "{raw}");
        }
    }

    #[test]
    fn oversized_relative_amounts_stay_unset() {
        let now = captured();
        for raw in [
            "99999999999999999s",
            "99999999999999999 weeks ago",
            "9223372036854775807 days ago",
            "999999999999999999999h",
        ] {
            assert_eq!(normalize_timestamp(raw, now), None, "{raw}");
        }
        assert_eq!(
            normalize_timestamp("100000000 weeks ago", now),
            None,
            "offset beyond the representable date range"
        );
    }
}
