//! Wall-clock helpers. DAG timestamps are Unix milliseconds.

/// Current Unix time in milliseconds.
pub fn unix_now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Whether a DAG timestamp is within `window_ms` of `now_ms`.
///
/// Timestamps in the future count as current.
pub fn is_recent(timestamp_ms: i64, now_ms: i64, window_ms: i64) -> bool {
    now_ms.saturating_sub(timestamp_ms) <= window_ms
}
