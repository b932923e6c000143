//! Exponential backoff with jitter, shared by discovery reconnects and
//! the ACME provider retries.

use rand::Rng;
use std::time::Duration;

/// Backoff policy: `base * 2^(attempt-1)`, capped at `max`, plus up to 10% jitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before retry number `attempt` (1-based). Attempt 0 never waits.
    pub fn delay(&self, attempt: u32) -> Duration {
        let capped = self.delay_without_jitter(attempt);
        let jitter_range = capped.as_millis() as u64 / 10;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..jitter_range)
        } else {
            0
        };
        capped + Duration::from_millis(jitter)
    }

    fn delay_without_jitter(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(31));
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));

        assert_eq!(backoff.delay(0), Duration::ZERO);
        assert!(backoff.delay(1) >= Duration::from_millis(100));
        assert!(backoff.delay(1) < Duration::from_millis(110));
        assert!(backoff.delay(2) >= Duration::from_millis(200));
        assert!(backoff.delay(3) >= Duration::from_millis(400));

        let capped = backoff.delay(20);
        assert!(capped >= Duration::from_millis(1000));
        assert!(capped < Duration::from_millis(1100));
    }

    #[test]
    fn test_backoff_huge_attempt_does_not_overflow() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        assert!(backoff.delay(u32::MAX) >= Duration::from_secs(30));
    }
}
