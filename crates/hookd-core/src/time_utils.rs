/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Returns true when `expires_at_ms` is present and no longer in the future.
pub fn is_expired_unix_ms(expires_at_ms: Option<u64>, now_ms: u64) -> bool {
    matches!(expires_at_ms, Some(value) if value <= now_ms)
}

/// Converts a relative expiry in seconds into an absolute millisecond deadline.
pub fn expiry_from_now_ms(now_ms: u64, expire_in_seconds: Option<u64>) -> Option<u64> {
    match expire_in_seconds {
        Some(0) | None => None,
        Some(seconds) => Some(now_ms.saturating_add(seconds.saturating_mul(1_000))),
    }
}
