//! Timestamps are persisted as milliseconds since the Unix epoch.

use chrono::{DateTime, Utc};
use std::time::Duration;

pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default()
}

pub fn now_millis() -> i64 {
    to_millis(Utc::now())
}

pub fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
