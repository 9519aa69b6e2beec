// genopt_core/src/utils.rs

//! Small parsing helpers shared by history providers.

use anyhow::Context;

/// Formats tried, in order, for textual timestamps.
const DATE_TIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

/// Converts a string representation of a date and time into a `chrono::DateTime<chrono::Utc>`.
///
/// Accepts unix seconds, RFC 3339 and the naive formats in `DATE_TIME_FORMATS`
/// (interpreted as UTC).
///
/// # Arguments
/// * `string` - The date-time string to parse (e.g., "2025-07-08 15:30:00").
///
/// # Returns
/// * `anyhow::Result<chrono::DateTime<chrono::Utc>>` - The parsed UTC date-time, or an error if no format matches.
pub fn string_to_date_time(string: &str) -> anyhow::Result<chrono::DateTime<chrono::Utc>> {
    let string = string.trim();

    if let Ok(seconds) = string.parse::<i64>() {
        return chrono::DateTime::<chrono::Utc>::from_timestamp(seconds, 0)
            .with_context(|| format!("Timestamp '{}' is out of range", string));
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(string) {
        return anyhow::Ok(dt.with_timezone(&chrono::Utc));
    }

    for format in DATE_TIME_FORMATS {
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(string, format) {
            return anyhow::Ok(chrono::DateTime::<chrono::Utc>::from_naive_utc_and_offset(dt, chrono::Utc));
        }
    }

    anyhow::bail!("Invalid date-time '{}'", string)
}
