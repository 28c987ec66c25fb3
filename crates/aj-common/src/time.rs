//! Epoch-millisecond time helpers.
//!
//! Time ranges handled by the core (extraction chunks, quantile timestamps)
//! are plain epoch milliseconds. These helpers convert them for display.

use chrono::{DateTime, TimeZone, Utc};

/// Milliseconds since the Unix epoch.
pub type EpochMillis = i64;

/// Current wall-clock time in epoch milliseconds.
pub fn now_epoch_ms() -> EpochMillis {
    Utc::now().timestamp_millis()
}

/// Convert epoch milliseconds to a UTC timestamp, if representable.
pub fn to_datetime(ms: EpochMillis) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Format epoch milliseconds as RFC 3339 for log fields.
///
/// Values outside chrono's range fall back to the raw number.
pub fn format_epoch_ms(ms: EpochMillis) -> String {
    match to_datetime(ms) {
        Some(dt) => dt.to_rfc3339(),
        None => ms.to_string(),
    }
}
