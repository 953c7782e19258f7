//! Retry policy for retryable task errors.
//!
//! Up to [`MAX_ATTEMPTS`] attempts with exponential backoff capped at ten
//! minutes and uniform jitter over the full window, so a burst of failing
//! tickers does not thunder back in lockstep.

use std::time::Duration;

use rand::Rng;

pub const MAX_ATTEMPTS: u32 = 3;

/// Backoff ceiling: 10 minutes.
pub const BACKOFF_CAP_SECS: u64 = 600;

/// Jittered delay before retrying after the `attempt`-th failure
/// (1-indexed). The un-jittered window doubles per attempt: 2s, 4s, 8s, …
/// capped at [`BACKOFF_CAP_SECS`].
pub fn backoff_delay(attempt: u32) -> Duration {
    let window = 2u64
        .saturating_pow(attempt.min(32))
        .min(BACKOFF_CAP_SECS);
    let jittered = rand::thread_rng().gen_range(0..=window);
    Duration::from_secs(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_stays_within_window() {
        for attempt in 1..=10 {
            let window = 2u64.saturating_pow(attempt).min(BACKOFF_CAP_SECS);
            for _ in 0..50 {
                let d = backoff_delay(attempt);
                assert!(d.as_secs() <= window, "attempt {attempt}: {d:?} > {window}s");
            }
        }
    }

    #[test]
    fn window_caps_at_ten_minutes() {
        for _ in 0..100 {
            assert!(backoff_delay(30).as_secs() <= BACKOFF_CAP_SECS);
        }
    }
}
