//! Reconnect backoff for coordination-plane subscriptions.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter.
///
/// Each call to [`next_delay`](ExponentialBackoff::next_delay) doubles the
/// delay up to a cap; a successful connection resets the sequence. Jitter
/// keeps a fleet of instances from hammering Redis in lockstep after an
/// outage.
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    jitter_factor: f64,
    current: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::with_bounds(Duration::from_millis(100), Duration::from_secs(30))
    }

    pub fn with_bounds(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            jitter_factor: 0.1,
            current: initial,
            attempt: 0,
        }
    }

    /// Disable jitter; used by tests that need deterministic delays.
    pub fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }

    /// The delay to sleep before the next reconnect attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;

        let doubled = self.current.saturating_mul(2).min(self.max);
        self.current = doubled;

        if self.jitter_factor <= 0.0 {
            return doubled;
        }

        let base_ms = doubled.as_millis() as f64;
        let jitter_range = base_ms * self.jitter_factor;
        let jitter = rand::rng().random_range(-jitter_range..jitter_range);
        Duration::from_millis((base_ms + jitter).max(1.0) as u64)
    }

    /// Called after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_until_capped() {
        let mut backoff =
            ExponentialBackoff::with_bounds(Duration::from_millis(100), Duration::from_secs(1))
                .without_jitter();

        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.next_delay(), Duration::from_millis(800));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.attempt(), 5);
    }

    #[test]
    fn test_reset_restarts_the_sequence() {
        let mut backoff =
            ExponentialBackoff::with_bounds(Duration::from_millis(100), Duration::from_secs(10))
                .without_jitter();

        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();

        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
    }

    #[test]
    fn test_jitter_stays_near_base() {
        let mut backoff =
            ExponentialBackoff::with_bounds(Duration::from_millis(1000), Duration::from_secs(30));

        let delay = backoff.next_delay();
        // 2000ms +/- 10%
        assert!(delay >= Duration::from_millis(1800));
        assert!(delay <= Duration::from_millis(2200));
    }
}
