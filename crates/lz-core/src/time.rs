//! Wall-clock helpers
//!
//! Device liveness is tracked as Unix milliseconds so the same value can be
//! compared against the freshness window and reported to consoles.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current Unix timestamp in milliseconds (0 if the clock is before the epoch)
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Milliseconds elapsed between `since` and `now` (0 if `since` is later)
pub fn elapsed_between(since: u64, now: u64) -> Duration {
    Duration::from_millis(now.saturating_sub(since))
}

/// Whether `since` lies less than `window` before `now`
pub fn is_within(since: u64, now: u64, window: Duration) -> bool {
    elapsed_between(since, now) < window
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_time_millis_is_positive() {
        assert!(current_time_millis() > 0);
    }

    #[test]
    fn test_elapsed_between_saturates() {
        assert_eq!(elapsed_between(5_000, 2_000), Duration::ZERO);
        assert_eq!(elapsed_between(2_000, 5_000), Duration::from_secs(3));
    }

    #[test]
    fn test_is_within() {
        let window = Duration::from_secs(10);
        assert!(is_within(1_000, 10_999, window));
        assert!(!is_within(1_000, 11_000, window));
        assert!(is_within(20_000, 10_000, window));
    }
}
