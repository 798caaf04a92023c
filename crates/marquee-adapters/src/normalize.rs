//! Field-level normalization. Nothing here fails: malformed input degrades to a default.

use chrono::{Datelike, NaiveDate, Utc};

/// External release-date format, e.g. `22-Nov-95`.
pub const RELEASE_DATE_FORMAT: &str = "%d-%b-%y";

const PLACEHOLDERS: &[&str] = &["N/A", "(no genres listed)"];

fn is_placeholder(token: &str) -> bool {
    PLACEHOLDERS.iter().any(|p| token.eq_ignore_ascii_case(p))
}

/// `22-Nov-95` -> 1995-11-22. Anything else is absent.
pub fn parse_release_date(raw: &str) -> Option<NaiveDate> {
    parse_release_date_as_of(raw, Utc::now().date_naive())
}

/// Two-digit years are read as 1970-2069, then any date after `today` is moved back a
/// century, so `23-Jan-42` is 1942 and `20-Jul-69` is 1969.
pub fn parse_release_date_as_of(raw: &str, today: NaiveDate) -> Option<NaiveDate> {
    let date = NaiveDate::parse_from_str(raw.trim(), RELEASE_DATE_FORMAT).ok()?;
    if date <= today {
        return Some(date);
    }
    date.with_year(date.year() - 100)
}

/// `"87%"` -> 87.0.
pub fn parse_percentage(raw: &str) -> Option<f32> {
    let trimmed = raw.trim();
    let number = trimmed.strip_suffix('%').unwrap_or(trimmed).trim();
    number.parse::<f32>().ok().filter(|v| v.is_finite())
}

/// Counts default to zero when they are not numeric.
pub fn parse_count(raw: &str) -> i32 {
    raw.trim().replace(',', "").parse::<i32>().unwrap_or(0)
}

/// Leading integer minutes: `"81 min"` -> 81, otherwise 0.
pub fn parse_runtime(raw: &str) -> i32 {
    let digits: String = raw
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse::<i32>().unwrap_or(0)
}

pub fn parse_timestamp(raw: &str) -> i64 {
    raw.trim().parse::<i64>().unwrap_or(0)
}

pub fn parse_id(raw: &str) -> Option<i32> {
    raw.trim().parse::<i32>().ok()
}

/// Trimmed text, absent when empty or a placeholder.
pub fn optional_text(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || is_placeholder(trimmed) {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Split a multi-valued field, keeping left-to-right order.
pub fn split_list(raw: &str, delimiter: char) -> Vec<String> {
    raw.split(delimiter)
        .map(str::trim)
        .filter(|token| !token.is_empty() && !is_placeholder(token))
        .map(str::to_string)
        .collect()
}
