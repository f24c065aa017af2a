use crate::error::GatewayError;
use chrono::{DateTime, SecondsFormat, Utc};

/// 存储统一使用 RFC3339（UTC, `Z`）
pub fn to_iso8601_utc_string(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_datetime_string(s: &str) -> crate::error::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| GatewayError::TimeParse(format!("{}: {}", s, e)))
}
