//! Reconnect delays: exponential growth, capped, with full jitter.

use rand::Rng;
use std::time::Duration;

#[derive(Clone, Debug)]
pub(crate) struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub(crate) fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Upper bound of the next delay: `min(base * 2^attempt, cap)`.
    pub(crate) fn ceiling(&self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// A random delay in `[0, ceiling]`; advances the attempt counter.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let ceiling_ms = self.ceiling().as_millis().min(u64::MAX as u128) as u64;
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(rand::rng().random_range(0..=ceiling_ms))
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delays handed out since the last reset.
    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_doubles_until_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));
        let mut ceilings = Vec::new();
        for _ in 0..6 {
            ceilings.push(backoff.ceiling().as_millis());
            backoff.next_delay();
        }
        assert_eq!(ceilings, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn test_delays_stay_under_ceiling() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_millis(600));
        for _ in 0..50 {
            assert!(backoff.next_delay() <= Duration::from_millis(600));
        }
    }

    #[test]
    fn test_huge_attempt_counts_saturate() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(120));
        for _ in 0..200 {
            backoff.next_delay();
        }
        assert_eq!(backoff.ceiling(), Duration::from_secs(120));
    }

    #[test]
    fn test_reset_clears_attempts() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(120));
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 1);
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.ceiling(), Duration::from_secs(1));
    }
}
