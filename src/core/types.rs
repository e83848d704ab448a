//! Shared scalar types
//!
//! Timestamps and the textual date format used by the XML node files.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

/// Point in time used for node creation/modification stamps and date values
pub type Timestamp = DateTime<Utc>;

/// Date format of `created`/`lastModified` attributes and date properties
pub const DATE_FORMAT: &str = "%d.%m.%Y %H:%M:%S";

/// Current time truncated to whole seconds, the resolution of stored dates
pub fn now() -> Timestamp {
    let now = Utc::now();
    Utc.timestamp_opt(now.timestamp(), 0).single().unwrap_or(now)
}

/// Render a timestamp in the stored date format
pub fn format_date(ts: &Timestamp) -> String {
    ts.format(DATE_FORMAT).to_string()
}

/// Parse a date in the stored date format, falling back to epoch millis
pub fn parse_date(text: &str) -> Option<Timestamp> {
    let text = text.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, DATE_FORMAT) {
        return Some(Utc.from_utc_datetime(&naive));
    }
    text.parse::<i64>()
        .ok()
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_date_round_trip() {
        let ts = Utc.with_ymd_and_hms(2004, 3, 17, 9, 5, 59).unwrap();
        let text = format_date(&ts);
        assert_eq!(text, "17.03.2004 09:05:59");
        assert_eq!(parse_date(&text), Some(ts));
    }

    #[test]
    fn test_parse_millis_fallback() {
        let ts = parse_date("1000").unwrap();
        assert_eq!(ts.timestamp_millis(), 1000);
        assert!(parse_date("yesterday").is_none());
    }
}
