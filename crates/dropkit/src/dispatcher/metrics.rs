//! Read-only dispatcher view for logging and status output.

use serde::Serialize;

use crate::rate_limit::{BreakerStatus, RateLimitState};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatcherMetrics {
    pub scope: String,
    pub state: RateLimitState,
    pub breaker: BreakerStatus,
    /// Queued items, including those waiting out a backoff.
    pub queue_size: usize,
    pub in_flight: bool,
    pub cache_entries: usize,
}

impl DispatcherMetrics {
    pub fn remaining(&self) -> u64 {
        self.state.remaining
    }

    pub fn breaker_open(&self) -> bool {
        self.breaker.open
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.breaker.consecutive_failures
    }
}
