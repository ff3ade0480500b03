/// Time utilities shared across the engine.
///
/// Meeting-point derivation needs UTC calendar dates and hour stamps;
/// everything else uses Unix timestamps.

/// Returns the current Unix timestamp in seconds.
pub fn now_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Returns the current Unix timestamp in milliseconds.
pub fn now_timestamp_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
