//! Naive timestamp handling.
//!
//! Every instant the ledger compares is a `NaiveDateTime`. Offset-carrying input is
//! reduced to its wall-clock value (the offset is dropped, not applied) before it
//! reaches any comparison.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::error::{LedgerError, LedgerResult};

pub const STORAGE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

pub fn strip_offset<Tz: TimeZone>(ts: &DateTime<Tz>) -> NaiveDateTime {
    ts.naive_local()
}

/// Wall-clock "now" in UTC, without offset.
pub fn now_naive() -> NaiveDateTime {
    Utc::now().naive_utc()
}

/// Parses RFC 3339 (offset stripped), naive date-times, or a bare `YYYY-MM-DD`
/// (midnight).
pub fn parse_timestamp(raw: &str, field_name: &str) -> LedgerResult<NaiveDateTime> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(LedgerError::Validation(format!("{field_name} 不能为空")));
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Ok(strip_offset(&ts));
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(text, fmt) {
            return Ok(ts);
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| {
            LedgerError::Validation(format!(
                "{field_name} 日期格式必须为 RFC3339、YYYY-MM-DD HH:MM:SS 或 YYYY-MM-DD: {text}"
            ))
        })
}

pub fn parse_optional_timestamp(
    raw: Option<&str>,
    field_name: &str,
) -> LedgerResult<Option<NaiveDateTime>> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => parse_timestamp(text, field_name).map(Some),
    }
}

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(STORAGE_FORMAT).to_string()
}

/// Seconds since the epoch, reading the naive value as UTC.
pub fn epoch_seconds(ts: &NaiveDateTime) -> i64 {
    ts.and_utc().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    #[test]
    fn offset_is_dropped_not_applied() {
        let aware = FixedOffset::west_opt(5 * 3600)
            .expect("offset")
            .with_ymd_and_hms(2024, 1, 10, 9, 30, 0)
            .single()
            .expect("aware ts");
        let naive = strip_offset(&aware);
        assert_eq!(format_timestamp(&naive), "2024-01-10 09:30:00");
    }

    #[test]
    fn parses_the_accepted_shapes() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 10)
            .and_then(|d| d.and_hms_opt(9, 30, 0))
            .expect("ts");
        assert_eq!(
            parse_timestamp("2024-01-10T09:30:00-05:00", "start").expect("rfc3339"),
            expected
        );
        assert_eq!(
            parse_timestamp("2024-01-10 09:30:00", "start").expect("naive"),
            expected
        );
        assert_eq!(
            parse_timestamp("2024-01-10", "start").expect("date"),
            expected.date().and_hms_opt(0, 0, 0).expect("midnight")
        );
    }

    #[test]
    fn rejects_garbage_and_blank() {
        assert!(parse_timestamp("yesterday", "start").is_err());
        assert!(parse_timestamp("  ", "start").is_err());
        assert_eq!(parse_optional_timestamp(Some(" "), "end").expect("blank"), None);
    }

    #[test]
    fn epoch_reads_naive_as_utc() {
        let ts = NaiveDate::from_ymd_opt(1970, 1, 2)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .expect("ts");
        assert_eq!(epoch_seconds(&ts), 86_400);
    }
}
