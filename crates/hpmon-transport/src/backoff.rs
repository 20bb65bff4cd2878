//! Exponential backoff for reconnect delays.
//!
//! The delay for attempt `n` (starting at zero) is `initial * factor^n`,
//! capped at `max`. A randomization factor `r` moves each delay up or down by
//! at most `r * delay` so that many clients dropped by the same server restart
//! do not reconnect in lockstep.

use rand::Rng;
use std::time::Duration;

/// Default multiplier applied per attempt.
pub const DEFAULT_FACTOR: f64 = 2.0;

#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    /// The initial backoff delay.
    delay_initial: Duration,
    /// The maximum delay to cap the backoff.
    delay_max: Duration,
    /// The factor to multiply the delay on each attempt.
    factor: f64,
    /// Fraction of the delay used as random deviation, in `[0, 1]`.
    randomization: f64,
    /// Number of delays handed out since the last reset.
    attempts: u32,
}

impl ExponentialBackoff {
    /// Create a new backoff.
    ///
    /// `randomization` is clamped to `[0, 1]`.
    #[must_use]
    pub fn new(delay_initial: Duration, delay_max: Duration, randomization: f64) -> Self {
        Self {
            delay_initial,
            delay_max,
            factor: DEFAULT_FACTOR,
            randomization: randomization.clamp(0.0, 1.0),
            attempts: 0,
        }
    }

    /// Use a different growth factor.
    #[must_use]
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor.max(1.0);
        self
    }

    /// Return the next delay and count the attempt.
    pub fn next_duration(&mut self) -> Duration {
        let initial_ms = self.delay_initial.as_millis() as f64;
        let max_ms = self.delay_max.as_millis() as f64;
        let base = (initial_ms * self.factor.powi(self.attempts.min(63) as i32)).min(max_ms);
        self.attempts = self.attempts.saturating_add(1);

        let mut delay = base;
        if self.randomization > 0.0 {
            let r: f64 = rand::rng().random();
            let deviation = (r * self.randomization * base).floor();
            if ((r * 10.0).floor() as u64) & 1 == 0 {
                delay -= deviation;
            } else {
                delay += deviation;
            }
        }

        Duration::from_millis(delay.clamp(0.0, max_ms) as u64)
    }

    /// Reset the backoff after a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Number of delays handed out since the last reset.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_jitter_exponential_growth() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(1000), Duration::from_millis(30_000), 0.0);

        let delays: Vec<u64> = (0..7)
            .map(|_| backoff.next_duration().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16_000, 30_000, 30_000]);
        assert_eq!(backoff.attempts(), 7);
    }

    #[test]
    fn test_reset() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(1600), 0.0);

        backoff.next_duration();
        backoff.next_duration();
        backoff.reset();

        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_duration(), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_within_bounds() {
        for _ in 0..50 {
            let mut backoff = ExponentialBackoff::new(
                Duration::from_millis(1000),
                Duration::from_millis(30_000),
                0.5,
            );
            backoff.next_duration();
            // Second attempt has a base of 2000ms.
            let delay = backoff.next_duration().as_millis() as u64;
            assert!((1000..=3000).contains(&delay), "delay {delay} out of bounds");
        }
    }

    #[test]
    fn test_jitter_never_exceeds_max() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(1000), Duration::from_millis(5000), 1.0);
        for _ in 0..100 {
            assert!(backoff.next_duration() <= Duration::from_millis(5000));
        }
    }

    #[test]
    fn test_custom_factor() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(1000), 0.0)
                .with_factor(1.5);
        assert_eq!(backoff.next_duration(), Duration::from_millis(100));
        assert_eq!(backoff.next_duration(), Duration::from_millis(150));
        assert_eq!(backoff.next_duration(), Duration::from_millis(225));
    }

    #[test]
    fn test_randomization_is_clamped() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(100), 7.0);
        for _ in 0..20 {
            assert!(backoff.next_duration() <= Duration::from_millis(100));
        }
    }
}
