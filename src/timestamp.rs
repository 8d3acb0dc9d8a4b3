use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static RE_ISO_ANY: Lazy<Regex> = Lazy::new(|| {
    // 2025-08-07T06:41:18Z, 2025-08-07 06:41:18.123+01:00, 2025-08-07T06:41:18
    Regex::new(r"\b\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d{1,9})?(?:Z|[+-]\d{2}:?\d{2})?").unwrap()
});

static RE_TZ_COMPACT: Lazy<Regex> = Lazy::new(|| Regex::new(r"([+-])(\d{2})(\d{2})$").unwrap());

const NAIVE_FORMATS: [&str; 7] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y/%m/%d %H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
];

/// Parse a whole string as a timestamp. Accepts RFC 3339, common naive
/// layouts (taken as UTC), compact `+HHMM` offsets, and 10/13/16 digit epochs.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Some(caps) = RE_TZ_COMPACT.captures(s) {
        let whole = caps.get(0).map(|m| m.start()).unwrap_or(s.len());
        let fixed = format!("{}{}{}:{}", &s[..whole], &caps[1], &caps[2], &caps[3]);
        if let Ok(dt) = DateTime::parse_from_rfc3339(&fixed.replacen(' ', "T", 1)) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for f in NAIVE_FORMATS.iter() {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(s, f) {
            return Some(Utc.from_utc_datetime(&ndt));
        }
    }
    parse_epoch_digits(s)
}

fn parse_epoch_digits(s: &str) -> Option<DateTime<Utc>> {
    if !s.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let n = s.parse::<i64>().ok()?;
    match s.len() {
        10 => DateTime::<Utc>::from_timestamp(n, 0),
        13 => DateTime::<Utc>::from_timestamp(n / 1000, ((n % 1000) * 1_000_000) as u32),
        16 => DateTime::<Utc>::from_timestamp(n / 1_000_000, ((n % 1_000_000) * 1_000) as u32),
        _ => None,
    }
}

/// Timestamp carried by a JSON value: a parseable string or an integer epoch
/// in seconds, milliseconds or microseconds.
pub fn timestamp_from_value(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::String(s) => parse_timestamp(s),
        Value::Number(n) => n.as_i64().and_then(|i| parse_epoch_digits(&i.to_string())),
        _ => None,
    }
}

/// True when a string value should be typed as a timestamp during inference.
/// Bare digit strings are left alone so ids don't turn into dates.
pub fn looks_like_timestamp(s: &str) -> bool {
    !s.chars().all(|c| c.is_ascii_digit()) && parse_timestamp(s).is_some()
}

/// First ISO-looking timestamp inside free text, e.g. a timeline bullet.
pub fn detect_timestamp_in_text(s: &str) -> Option<DateTime<Utc>> {
    RE_ISO_ANY.find(s).and_then(|m| parse_timestamp(m.as_str()))
}

pub fn to_rfc3339(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Index of the `bucket_secs` boundary nearest to `dt`; exact halves round up.
pub fn nearest_bucket(dt: &DateTime<Utc>, bucket_secs: i64) -> i64 {
    let width = bucket_secs.max(1);
    let secs = dt.timestamp();
    (secs + width / 2).div_euclid(width)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_rfc3339_and_naive_layouts() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 15, 14, 20, 0).unwrap();
        assert_eq!(parse_timestamp("2024-01-15T14:20:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-15 14:20:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-15T15:20:00+01:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-15 15:20:00+0100"), Some(expected));
    }

    #[test]
    fn epoch_numbers_by_digit_count() {
        let secs = timestamp_from_value(&serde_json::json!(1700000000)).unwrap();
        let millis = timestamp_from_value(&serde_json::json!(1700000000123u64)).unwrap();
        assert_eq!(secs.timestamp(), 1_700_000_000);
        assert_eq!(millis.timestamp_subsec_millis(), 123);
        assert!(timestamp_from_value(&serde_json::json!(504)).is_none());
    }

    #[test]
    fn digit_strings_are_not_inferred_as_timestamps() {
        assert!(!looks_like_timestamp("1700000000"));
        assert!(looks_like_timestamp("2024-01-01T00:00:00Z"));
        assert!(!looks_like_timestamp("timeout"));
    }

    #[test]
    fn finds_timestamp_inside_text() {
        let ts = detect_timestamp_in_text("- 2024-01-01T00:02:00Z gateway returned 504").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 1, 1, 0, 2, 0).unwrap());
    }

    #[test]
    fn bucket_rounds_to_nearest() {
        let a = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 20).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 40).unwrap();
        assert_eq!(nearest_bucket(&a, 60), 28_401_120);
        assert_eq!(nearest_bucket(&b, 60), 28_401_121);
        let half = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 30).unwrap();
        assert_eq!(nearest_bucket(&half, 60), 28_401_121);
    }
}
