//! Capture timestamps are carried as nanoseconds since the Unix epoch and only
//! turned into calendar time at the persistence boundary.

use chrono::{DateTime, Utc};

pub const NANOS_PER_SEC: u64 = 1_000_000_000;
pub const NANOS_PER_MILLI: u64 = 1_000_000;

/// Converts capture nanoseconds to a UTC timestamp.
pub fn to_datetime(timestamp_ns: u64) -> DateTime<Utc> {
    let secs = (timestamp_ns / NANOS_PER_SEC) as i64;
    let nanos = (timestamp_ns % NANOS_PER_SEC) as u32;
    DateTime::from_timestamp(secs, nanos).unwrap_or_default()
}
