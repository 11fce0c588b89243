//! Exponential backoff for retried cluster writes

use std::time::Duration;

use crate::config::BackoffConfig;

/// Exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Current delay
    current: Duration,
    /// Maximum delay
    max: Duration,
    /// Multiplier
    multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    jitter: f64,
}

impl ExponentialBackoff {
    /// Create a new backoff from configuration
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.initial, config.max, config.multiplier, config.jitter)
    }

    /// Create a new backoff with custom parameters.
    ///
    /// A multiplier below 1.0 or not finite is treated as 1.0; jitter is
    /// clamped to [0, 1] and NaN jitter disables it.
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        let multiplier = if multiplier.is_finite() && multiplier >= 1.0 {
            multiplier
        } else {
            1.0
        };
        let jitter = if jitter.is_nan() { 0.0 } else { jitter.clamp(0.0, 1.0) };

        Self {
            current: initial,
            max,
            multiplier,
            jitter,
        }
    }

    /// Get the next delay and advance the backoff
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;

        let next = self.current.as_secs_f64() * self.multiplier;
        self.current = if next >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(next)
        };

        let jitter_amount = delay.as_secs_f64() * self.jitter * rand::random::<f64>();
        delay + Duration::from_secs_f64(jitter_amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_increases() {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_millis(10),
            Duration::from_secs(1),
            2.0,
            0.0,
        );

        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        assert_eq!(backoff.next_delay(), Duration::from_millis(40));
    }

    #[test]
    fn test_backoff_constant_with_unit_multiplier() {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_millis(10),
            Duration::from_secs(1),
            1.0,
            0.0,
        );

        for _ in 0..5 {
            assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        }
    }

    #[test]
    fn test_backoff_max() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(30), Duration::from_secs(60), 2.0, 0.0);

        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
        assert_eq!(backoff.next_delay(), Duration::from_secs(60));
        assert_eq!(backoff.next_delay(), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_within_bound() {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_millis(100),
            Duration::from_secs(1),
            1.0,
            0.1,
        );

        for _ in 0..20 {
            let d = backoff.next_delay();
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(110));
        }
    }

    #[test]
    fn test_bad_parameters_do_not_panic() {
        for multiplier in [-1.0, 0.5, f64::NAN, f64::INFINITY] {
            let mut backoff = ExponentialBackoff::new(
                Duration::from_millis(10),
                Duration::from_secs(1),
                multiplier,
                0.0,
            );
            for _ in 0..3 {
                assert_eq!(backoff.next_delay(), Duration::from_millis(10));
            }
        }

        for jitter in [-0.5, f64::NAN] {
            let mut backoff = ExponentialBackoff::new(
                Duration::from_millis(10),
                Duration::from_secs(1),
                2.0,
                jitter,
            );
            assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        }
    }

    #[test]
    fn test_huge_multiplier_stops_at_max() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(5), 1e300, 0.0);

        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
    }
}
