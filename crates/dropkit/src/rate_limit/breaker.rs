//! Consecutive-failure circuit breaker.
//!
//! Closed until the failure count reaches the threshold, then open for a
//! fixed duration. There is no half-open state: once `open_until` passes,
//! the next attempt is a normal one, and its success resets the count.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

/// Read-only view of the breaker for metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerStatus {
    pub open: bool,
    pub open_until: Option<DateTime<Utc>>,
    pub cooldown_remaining: Option<Duration>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: u32,
    open_duration: Duration,
    consecutive_failures: u32,
    open_until: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, open_duration: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            open_duration,
            consecutive_failures: 0,
            open_until: None,
        }
    }

    /// Restore persisted counters.
    pub fn restore(&mut self, consecutive_failures: u32, open_until: Option<DateTime<Utc>>) {
        self.consecutive_failures = consecutive_failures;
        self.open_until = open_until;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn open_until(&self) -> Option<DateTime<Utc>> {
        self.open_until
    }

    /// Count a failure. Returns true if this failure (re)opened the breaker.
    ///
    /// `open_until` only ever moves forward.
    pub fn record_failure(&mut self, now: DateTime<Utc>) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures < self.threshold {
            return false;
        }

        let duration = chrono::Duration::from_std(self.open_duration)
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)));
        let candidate = now + duration;
        let until = match self.open_until {
            Some(existing) if existing > candidate => existing,
            _ => candidate,
        };
        self.open_until = Some(until);

        warn!(
            "Circuit breaker open for {:.1}s after {} consecutive failures",
            self.open_duration.as_secs_f64(),
            self.consecutive_failures
        );
        true
    }

    pub fn record_success(&mut self) {
        if self.consecutive_failures > 0 {
            info!(
                "Recovered after {} consecutive failures",
                self.consecutive_failures
            );
        }
        self.consecutive_failures = 0;
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.open_until.map(|until| now < until).unwrap_or(false)
    }

    /// Remaining cool-down if the breaker is open.
    pub fn cooldown(&self, now: DateTime<Utc>) -> Option<Duration> {
        let until = self.open_until?;
        (until - now).to_std().ok().filter(|d| !d.is_zero())
    }

    pub fn status(&self, now: DateTime<Utc>) -> BreakerStatus {
        BreakerStatus {
            open: self.is_open(now),
            open_until: self.open_until,
            cooldown_remaining: self.cooldown(now),
            consecutive_failures: self.consecutive_failures,
        }
    }
}
