//! Server-communicated quota state.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use super::headers::{parse_remaining, parse_reset, parse_retry_after, QuotaHeaderNames};
use crate::transport::header_value;

/// Optimistic quota assumed before the upstream says otherwise.
pub const DEFAULT_INITIAL_REMAINING: u64 = 1000;

/// Current view of the upstream quota, refreshed from every response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitState {
    pub remaining: u64,
    pub reset_at: Option<DateTime<Utc>>,
    pub retry_after: Option<Duration>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_REMAINING)
    }
}

impl RateLimitState {
    pub fn new(initial_remaining: u64) -> Self {
        Self {
            remaining: initial_remaining,
            reset_at: None,
            retry_after: None,
            last_updated: None,
        }
    }

    /// Time left until the quota window resets (zero if unknown or past).
    pub fn until_reset(&self, now: DateTime<Utc>) -> Duration {
        self.reset_at
            .and_then(|reset| (reset - now).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }

    /// No quota left and the reset is still ahead of us.
    pub fn is_exhausted(&self, now: DateTime<Utc>) -> bool {
        self.remaining == 0 && self.until_reset(now) > Duration::ZERO
    }

    /// Refresh from response headers. Headers that are absent leave the
    /// previous value in place, except retry-after which only applies to
    /// the response that carried it.
    pub fn apply_headers(
        &mut self,
        headers: &HashMap<String, String>,
        names: &QuotaHeaderNames,
        now: DateTime<Utc>,
    ) {
        if let Some(raw) = header_value(headers, &names.remaining) {
            match parse_remaining(raw) {
                Some(remaining) => self.remaining = remaining,
                None => warn!("Ignoring unparseable {} header: {}", names.remaining, raw),
            }
        }

        if let Some(raw) = header_value(headers, &names.reset) {
            match parse_reset(raw) {
                Some(reset) => self.reset_at = Some(reset),
                None => warn!("Ignoring unparseable {} header: {}", names.reset, raw),
            }
        }

        self.retry_after = header_value(headers, &names.retry_after).and_then(|raw| {
            let parsed = parse_retry_after(raw, now);
            if parsed.is_none() {
                warn!("Ignoring unparseable {} header: {}", names.retry_after, raw);
            }
            parsed
        });

        self.last_updated = Some(now);

        debug!(
            "Rate limit updated: {} remaining, resets in {:.1}s",
            self.remaining,
            self.until_reset(now).as_secs_f64()
        );
    }
}
