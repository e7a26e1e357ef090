/// Milliseconds since the Unix epoch.
pub fn timestamp_now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
