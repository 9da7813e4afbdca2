//! Exponential backoff shared by a poller's sub-fetches.

use rand::Rng;
use std::time::Duration;

/// Delay that doubles on every failure up to `max`, and drops back to `base`
/// after a success.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self {
            base,
            max,
            current: base,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Record a failure, returning the new delay.
    pub fn on_failure(&mut self) -> Duration {
        self.current = self.current.saturating_mul(2).min(self.max);
        self.current
    }

    pub fn on_success(&mut self) {
        self.current = self.base;
    }

    /// The current delay with up to 20% jitter either way, never above `max`.
    pub fn jittered(&self) -> Duration {
        let factor = rand::rng().random_range(0.8..=1.2);
        self.current.mul_f64(factor).min(self.max)
    }

    pub async fn sleep(&self) {
        tokio::time::sleep(self.jittered()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_are_non_decreasing_and_capped() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(8));
        let mut previous = backoff.current();
        for _ in 0..10 {
            let next = backoff.on_failure();
            assert!(next >= previous);
            assert!(next <= Duration::from_secs(8));
            previous = next;
        }
        assert_eq!(backoff.current(), Duration::from_secs(8));
    }

    #[test]
    fn one_success_resets_to_base() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(8));
        backoff.on_failure();
        backoff.on_failure();
        backoff.on_success();
        assert_eq!(backoff.current(), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_near_current() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10));
        backoff.on_failure();
        for _ in 0..50 {
            let delay = backoff.jittered();
            assert!(delay >= Duration::from_millis(1600));
            assert!(delay <= Duration::from_millis(2400));
        }
    }
}
