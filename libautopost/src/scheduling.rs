//! Human-readable schedule parsing for the CLI, and repeat arithmetic
//!
//! Accepts relative durations ("30m", "2h", "1d"), natural language
//! ("tomorrow 3pm", "next monday 10am"), absolute times ("2025-11-20 15:00",
//! RFC 3339) and unix timestamps. All parsing is relative to a caller-supplied
//! `now` so results are reproducible.

use chrono::{DateTime, Datelike, Duration, Months, NaiveDateTime, TimeZone, Utc};

use crate::types::Recurrence;
use crate::{AutopostError, Result};

/// Largest relative offset accepted for a schedule
const MAX_AHEAD_SECONDS: i64 = 365 * 24 * 3600;

/// Parse a schedule string into a due time.
///
/// # Errors
///
/// Returns `InvalidInput` if nothing matches or the result is out of range.
pub fn parse_schedule(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return Err(AutopostError::InvalidInput(
            "Schedule string cannot be empty".to_string(),
        ));
    }

    if input.eq_ignore_ascii_case("now") {
        return Ok(now);
    }

    if let Some(dt) = parse_absolute(input) {
        return Ok(dt);
    }

    if let Ok(duration) = parse_duration(input.strip_prefix("in ").unwrap_or(input)) {
        return Ok(now + duration);
    }

    chrono_english::parse_date_string(input, now, chrono_english::Dialect::Us).map_err(|e| {
        AutopostError::InvalidInput(format!("Could not parse schedule '{}': {}", input, e))
    })
}

/// Parse a relative window such as "15m" or "2h" for due-soon listings
pub fn parse_window(input: &str) -> Result<Duration> {
    parse_duration(input.trim())
}

/// First occurrence of a series anchored at `anchor` that falls strictly
/// after `after`, or `None` for a one-off post.
///
/// Occurrences are always counted from the anchor, so a monthly series
/// anchored on the 31st lands on the last day of shorter months and returns
/// to the 31st afterwards.
pub fn next_occurrence(recurrence: Recurrence, anchor: i64, after: i64) -> Option<i64> {
    let step = match recurrence {
        Recurrence::Once => return None,
        Recurrence::Daily => 86_400,
        Recurrence::Weekly => 7 * 86_400,
        Recurrence::Monthly => return next_monthly(anchor, after),
    };
    let periods = if after < anchor {
        1
    } else {
        (after - anchor) / step + 1
    };
    anchor.checked_add(periods.checked_mul(step)?)
}

fn next_monthly(anchor: i64, after: i64) -> Option<i64> {
    let start = DateTime::from_timestamp(anchor, 0)?;
    let until = DateTime::from_timestamp(after, 0)?;
    let elapsed = (until.year() - start.year()) * 12 + until.month() as i32 - start.month() as i32;

    let mut months = elapsed.max(1) as u32;
    loop {
        let candidate = start.checked_add_months(Months::new(months))?.timestamp();
        if candidate > after {
            return Some(candidate);
        }
        months = months.checked_add(1)?;
    }
}

fn parse_duration(input: &str) -> Result<Duration> {
    let std_duration = humantime::parse_duration(input).map_err(|e| {
        AutopostError::InvalidInput(format!("Could not parse duration '{}': {}", input, e))
    })?;

    let seconds = i64::try_from(std_duration.as_secs()).unwrap_or(i64::MAX);
    if seconds > MAX_AHEAD_SECONDS {
        return Err(AutopostError::InvalidInput(format!(
            "Duration '{}' is more than a year ahead",
            input
        )));
    }

    Duration::try_seconds(seconds)
        .ok_or_else(|| AutopostError::InvalidInput("Duration out of range".to_string()))
}

fn parse_absolute(input: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    // Bare digits are unix seconds; anything shorter than 9 digits is too
    // ambiguous to accept
    if input.len() >= 9 && input.chars().all(|c| c.is_ascii_digit()) {
        return input
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_relative_durations() {
        let now = fixed_now();
        assert_eq!(
            parse_schedule("30m", now).unwrap(),
            now + Duration::minutes(30)
        );
        assert_eq!(parse_schedule("2h", now).unwrap(), now + Duration::hours(2));
        assert_eq!(
            parse_schedule("1d", now).unwrap(),
            now + Duration::days(1)
        );
        assert_eq!(
            parse_schedule("in 45m", now).unwrap(),
            now + Duration::minutes(45)
        );
    }

    #[test]
    fn test_parse_now() {
        let now = fixed_now();
        assert_eq!(parse_schedule("NOW", now).unwrap(), now);
    }

    #[test]
    fn test_parse_absolute_times() {
        let now = fixed_now();
        let expected = Utc.with_ymd_and_hms(2025, 11, 20, 15, 0, 0).unwrap();

        assert_eq!(parse_schedule("2025-11-20 15:00", now).unwrap(), expected);
        assert_eq!(
            parse_schedule("2025-11-20T15:00:00Z", now).unwrap(),
            expected
        );
        assert_eq!(
            parse_schedule(&expected.timestamp().to_string(), now).unwrap(),
            expected
        );
    }

    #[test]
    fn test_parse_natural_language() {
        let now = fixed_now();
        let result = parse_schedule("tomorrow 3pm", now).unwrap();
        let hours = (result - now).num_hours();
        assert!((20..=30).contains(&hours), "got {} hours", hours);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let now = fixed_now();
        assert!(parse_schedule("", now).is_err());
        assert!(parse_schedule("whenever you like", now).is_err());
    }

    #[test]
    fn test_parse_rejects_far_future_durations() {
        let err = parse_schedule("400d", fixed_now()).unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_next_daily_and_weekly_occurrence() {
        let anchor = fixed_now().timestamp();
        assert_eq!(next_occurrence(Recurrence::Once, anchor, anchor), None);
        assert_eq!(
            next_occurrence(Recurrence::Daily, anchor, anchor),
            Some(anchor + 86_400)
        );
        // Missed days are skipped, the time of day is kept
        assert_eq!(
            next_occurrence(Recurrence::Daily, anchor, anchor + 3 * 86_400 + 5),
            Some(anchor + 4 * 86_400)
        );
        assert_eq!(
            next_occurrence(Recurrence::Weekly, anchor, anchor - 100),
            Some(anchor + 7 * 86_400)
        );
    }

    #[test]
    fn test_next_monthly_occurrence_clamps_to_month_end() {
        let anchor = Utc.with_ymd_and_hms(2025, 1, 31, 9, 0, 0).unwrap().timestamp();
        let feb = Utc.with_ymd_and_hms(2025, 2, 28, 9, 0, 0).unwrap().timestamp();
        let mar = Utc.with_ymd_and_hms(2025, 3, 31, 9, 0, 0).unwrap().timestamp();

        assert_eq!(next_occurrence(Recurrence::Monthly, anchor, anchor), Some(feb));
        assert_eq!(next_occurrence(Recurrence::Monthly, anchor, feb), Some(mar));

        let dec = Utc.with_ymd_and_hms(2025, 12, 15, 9, 0, 0).unwrap().timestamp();
        let jan = Utc.with_ymd_and_hms(2026, 1, 15, 9, 0, 0).unwrap().timestamp();
        assert_eq!(next_occurrence(Recurrence::Monthly, dec, dec + 60), Some(jan));
    }

    #[test]
    fn test_parse_window() {
        assert_eq!(parse_window("15m").unwrap(), Duration::minutes(15));
        assert!(parse_window("soon").is_err());
    }
}
