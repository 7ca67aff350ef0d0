use chrono::{DateTime, Utc};

/// Millisecond epoch column representation used across both databases.
pub fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

/// UTC calendar day used to roll the daily quota windows.
pub fn utc_day(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d").to_string()
}
