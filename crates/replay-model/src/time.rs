//! Timestamp parsing for capture files.

use chrono::{DateTime, NaiveDateTime, Utc};

/// Parse a capture timestamp into UTC.
///
/// Extraction tooling has emitted both RFC 3339 strings and naive
/// `YYYY-MM-DD HH:MM:SS[.ffffff]` strings over time; naive values are taken
/// to be UTC, which is what the capture pipeline records.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    let s = s.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .map(|naive| naive.and_utc())
}
