use chrono::{DateTime, Utc};
use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01).
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System clock is before the unix epoch")
        .as_secs()
}

/// Fractional unix timestamp carried in the `time` field of every request.
#[inline]
pub fn timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System clock is before the unix epoch")
        .as_secs_f64()
}

/// Wall-clock timestamp recorded in store rows.
#[inline]
pub fn now() -> DateTime<Utc> {
    Utc::now()
}
