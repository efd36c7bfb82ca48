//! Utility functions for Jicama
//!
//! Common helper functions used across the codebase.

/// Current wall-clock time in Unix milliseconds
///
/// # Examples
///
/// ```
/// use jicama_common::now_millis;
///
/// let ts = now_millis();
/// assert!(ts > 0);
/// ```
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Remaining portion of a millisecond deadline relative to `started_at`,
/// saturating at zero
pub fn remaining_millis(timeout_ms: u64, started_at: i64) -> u64 {
    let elapsed = now_millis().saturating_sub(started_at);
    timeout_ms.saturating_sub(elapsed.max(0) as u64)
}
