use crate::catalog::types::ColumnType;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike};

const MICROS_PER_DAY: i64 = 86_400 * 1_000_000;
/// TIMESTAMP covers `1970-01-01 00:00:01` to `2038-01-19 03:14:07` UTC.
const TIMESTAMP_MIN_MICROS: i64 = 1_000_000;
const TIMESTAMP_MAX_MICROS: i64 = 2_147_483_647 * 1_000_000;

const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];
const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%Y/%m/%d"];

fn to_naive(micros: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_micros(micros).map(|dt| dt.naive_utc())
}

fn from_naive(dt: NaiveDateTime) -> i64 {
    dt.and_utc().timestamp_micros()
}

pub fn format_datetime(micros: i64) -> String {
    match to_naive(micros) {
        Some(dt) if dt.nanosecond() != 0 => dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => micros.to_string(),
    }
}

pub fn format_date(micros: i64) -> String {
    match to_naive(micros) {
        Some(dt) => dt.format("%Y-%m-%d").to_string(),
        None => micros.to_string(),
    }
}

/// Renders a stored temporal value the way its column type displays it.
pub fn format_for(col_type: &ColumnType, micros: i64) -> String {
    match col_type {
        ColumnType::Date => format_date(micros),
        _ => format_datetime(micros),
    }
}

pub fn parse(text: &str) -> Option<i64> {
    let text = text.trim();
    if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) {
        return text.parse::<i64>().ok().and_then(from_number);
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(from_naive(dt));
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(text, fmt) {
            return d.and_hms_opt(0, 0, 0).map(from_naive);
        }
    }
    None
}

/// Interprets `YYYYMMDD`, `YYMMDD`, `YYYYMMDDhhmmss` or `YYMMDDhhmmss` numbers.
/// Zero and non-positive numbers are not valid dates.
pub fn from_number(value: i64) -> Option<i64> {
    if value <= 0 {
        return None;
    }
    let digits = value.to_string();
    let (date_part, time_part) = match digits.len() {
        5 | 6 => (value, 0),
        8 => (value, 0),
        11 | 12 => (value / 1_000_000, value % 1_000_000),
        14 => (value / 1_000_000, value % 1_000_000),
        _ => return None,
    };
    let mut year = (date_part / 10_000) as i32;
    if digits.len() <= 6 || digits.len() == 11 || digits.len() == 12 {
        year += if year < 70 { 2000 } else { 1900 };
    }
    let month = ((date_part / 100) % 100) as u32;
    let day = (date_part % 100) as u32;
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    let dt = date.and_hms_opt(
        (time_part / 10_000) as u32,
        ((time_part / 100) % 100) as u32,
        (time_part % 100) as u32,
    )?;
    Some(from_naive(dt))
}

/// `YYYYMMDD` for dates, `YYYYMMDDhhmmss` otherwise.
pub fn to_number(col_type: &ColumnType, micros: i64) -> Option<i64> {
    let dt = to_naive(micros)?;
    let date = i64::from(dt.year()) * 10_000 + i64::from(dt.month()) * 100 + i64::from(dt.day());
    if matches!(col_type, ColumnType::Date) {
        return Some(date);
    }
    let time = i64::from(dt.hour()) * 10_000 + i64::from(dt.minute()) * 100 + i64::from(dt.second());
    Some(date * 1_000_000 + time)
}

pub fn year_of(micros: i64) -> Option<i64> {
    to_naive(micros).map(|dt| i64::from(dt.year()))
}

pub fn truncate_to_day(micros: i64) -> i64 {
    micros.div_euclid(MICROS_PER_DAY) * MICROS_PER_DAY
}

pub fn timestamp_in_range(micros: i64) -> bool {
    (TIMESTAMP_MIN_MICROS..=TIMESTAMP_MAX_MICROS).contains(&micros)
}
