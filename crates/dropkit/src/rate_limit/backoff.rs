//! Retry delay calculation.

use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// Exponential backoff with up to 10% jitter, bounded by `max_wait`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_wait: Duration,
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_wait: Duration) -> Self {
        Self {
            base_delay,
            max_wait,
        }
    }

    /// Delay before retry number `attempt`.
    ///
    /// A server-provided `retry_after` wins over the exponential schedule,
    /// but is still capped at `max_wait`. A zero `retry_after` counts as
    /// absent.
    pub fn calculate(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        self.calculate_with_rng(attempt, retry_after, &mut rand::thread_rng())
    }

    pub fn calculate_with_rng<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        retry_after: Option<Duration>,
        rng: &mut R,
    ) -> Duration {
        if let Some(retry_after) = retry_after.filter(|d| !d.is_zero()) {
            if retry_after > self.max_wait {
                warn!(
                    "Capping retry-after from {:.1}s to {:.1}s",
                    retry_after.as_secs_f64(),
                    self.max_wait.as_secs_f64()
                );
                return self.max_wait;
            }
            return retry_after;
        }

        let delay = self.exponential(attempt);
        let jitter = delay * 0.1 * rng.gen::<f64>();
        let max = self.max_wait.as_secs_f64();
        Duration::try_from_secs_f64((delay + jitter).min(max)).unwrap_or(self.max_wait)
    }

    /// `2^attempt * base_delay` in seconds, before jitter and cap.
    pub fn exponential(&self, attempt: u32) -> f64 {
        let factor = 2f64.powi(attempt.min(1023) as i32);
        let delay = factor * self.base_delay.as_secs_f64();
        if delay.is_finite() {
            delay
        } else {
            f64::MAX
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_exponential_grows() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(300));
        assert_eq!(policy.exponential(0), 1.0);
        assert_eq!(policy.exponential(3), 8.0);
    }

    #[test]
    fn test_retry_after_wins() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(
            policy.calculate(4, Some(Duration::from_secs(7))),
            Duration::from_secs(7)
        );
        assert_eq!(
            policy.calculate(1, Some(Duration::from_secs(90))),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_zero_retry_after_uses_exponential() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(30));
        let mut rng = StdRng::seed_from_u64(3);
        let delay = policy.calculate_with_rng(3, Some(Duration::ZERO), &mut rng);
        assert!(delay >= Duration::from_millis(800), "{:?}", delay);
    }

    #[test]
    fn test_jitter_within_ten_percent() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(300));
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 0..8 {
            let base = policy.exponential(attempt);
            let delay = policy
                .calculate_with_rng(attempt, None, &mut rng)
                .as_secs_f64();
            assert!(delay >= base - 1e-9, "{} < {}", delay, base);
            assert!(delay <= base * 1.10 + 1e-9, "{} > {}", delay, base * 1.10);
        }
    }

    #[test]
    fn test_huge_attempt_is_capped() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(policy.calculate(5000, None), Duration::from_secs(10));
    }
}
