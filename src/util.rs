//! Shared helpers: timestamps and email normalization.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};

/// Format a UTC instant the way every table stores it (RFC 3339, microseconds, `Z`).
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current time in storage format.
pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Parse a stored timestamp.
///
/// Accepts RFC 3339, SQLite `datetime('now')` output, and bare `%Y-%m-%d`
/// dates (midnight UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    parse_date(raw).and_then(|d| d.and_hms_opt(0, 0, 0)).map(|n| n.and_utc())
}

/// Parse a `%Y-%m-%d` date, tolerating a trailing time component.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let head = raw.trim().get(..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

/// Lowercase and trim an email address. Returns `None` for blanks.
pub fn normalize_email(email: &str) -> Option<String> {
    let trimmed = email.trim();
    if trimmed.is_empty() || !trimmed.contains('@') {
        return None;
    }
    Some(trimmed.to_lowercase())
}

/// Normalize, dedupe and sort a participant list.
pub fn normalize_emails<S: AsRef<str>>(emails: &[S]) -> Vec<String> {
    let mut out: Vec<String> = emails
        .iter()
        .filter_map(|e| normalize_email(e.as_ref()))
        .collect();
    out.sort();
    out.dedup();
    out
}
