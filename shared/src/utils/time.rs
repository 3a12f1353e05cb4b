//! Capture timestamp utilities
//!
//! Capture timestamps are 14-digit UTC strings (`YYYYMMDDHHMMSS`). They sort
//! lexicographically and convert to epoch seconds and HTTP-date form.

use crate::error::IndexError;
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};

/// Length of a full capture timestamp.
pub const TIMESTAMP_LEN: usize = 14;

const PAD_DOWN: &str = "10000101000000";
const PAD_UP: &str = "29991231235959";

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Direction used when padding a partial timestamp to 14 digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pad {
    /// `2014` -> `20140101000000`
    Down,
    /// `2014` -> `20141231235959`
    Up,
}

/// Current time as a 14-digit capture timestamp.
pub fn now_timestamp() -> String {
    Utc::now().format("%Y%m%d%H%M%S").to_string()
}

fn check_digits(ts: &str) -> Result<(), IndexError> {
    if ts.is_empty() || ts.len() > TIMESTAMP_LEN || !ts.bytes().all(|b| b.is_ascii_digit()) {
        return Err(IndexError::bad_query(format!("invalid timestamp: {:?}", ts)));
    }
    Ok(())
}

/// Pad a partial timestamp (1-14 digits) to the full 14 digits.
pub fn pad_timestamp(ts: &str, pad: Pad) -> Result<String, IndexError> {
    check_digits(ts)?;
    let fill = match pad {
        Pad::Down => PAD_DOWN,
        Pad::Up => PAD_UP,
    };
    let mut out = String::with_capacity(TIMESTAMP_LEN);
    out.push_str(ts);
    out.push_str(&fill[ts.len()..]);
    Ok(out)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (ny, nm) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(ny, nm, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

/// Parse a (possibly partial) timestamp into a UTC datetime.
///
/// Out-of-range components are clamped, so `20140231` resolves to Feb 28.
pub fn timestamp_to_datetime(ts: &str) -> Result<DateTime<Utc>, IndexError> {
    let full = pad_timestamp(ts, Pad::Down)?;
    let part = |range: std::ops::Range<usize>| -> u32 {
        full[range].parse::<u32>().unwrap_or(0)
    };

    let year = part(0..4) as i32;
    let month = part(4..6).clamp(1, 12);
    let day = part(6..8).clamp(1, days_in_month(year, month));
    let hour = part(8..10).min(23);
    let minute = part(10..12).min(59);
    let second = part(12..14).min(59);

    Utc.with_ymd_and_hms(year, month, day, hour, minute, second)
        .single()
        .ok_or_else(|| IndexError::bad_query(format!("invalid timestamp: {:?}", ts)))
}

/// Seconds since the UNIX epoch for a capture timestamp.
pub fn timestamp_to_secs(ts: &str) -> Result<i64, IndexError> {
    Ok(timestamp_to_datetime(ts)?.timestamp())
}

/// 14-digit timestamp for an epoch second value.
pub fn secs_to_timestamp(secs: i64) -> String {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or_default()
        .format("%Y%m%d%H%M%S")
        .to_string()
}

/// `20140126200624` -> `Sun, 26 Jan 2014 20:06:24 GMT`
pub fn timestamp_to_http_date(ts: &str) -> Result<String, IndexError> {
    Ok(timestamp_to_datetime(ts)?.format(HTTP_DATE_FORMAT).to_string())
}

/// `Sun, 26 Jan 2014 20:06:24 GMT` -> `20140126200624`
pub fn http_date_to_timestamp(date: &str) -> Result<String, IndexError> {
    let parsed = DateTime::parse_from_rfc2822(date.trim())
        .map_err(|e| IndexError::bad_query(format!("invalid http date {:?}: {}", date, e)))?;
    Ok(parsed.with_timezone(&Utc).format("%Y%m%d%H%M%S").to_string())
}
