//! Quota and validator header names, plus value parsing.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Upstream-specific header names the dispatcher reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaHeaderNames {
    /// Requests left in the current window.
    pub remaining: String,
    /// Epoch seconds at which the window resets.
    pub reset: String,
    /// Server-suggested delay before the next attempt.
    pub retry_after: String,
    pub etag: String,
    pub last_modified: String,
}

impl Default for QuotaHeaderNames {
    fn default() -> Self {
        Self {
            remaining: "x-ratelimit-remaining".to_string(),
            reset: "x-ratelimit-reset".to_string(),
            retry_after: "retry-after".to_string(),
            etag: "etag".to_string(),
            last_modified: "last-modified".to_string(),
        }
    }
}

/// Parse a remaining-quota value. Negative values clamp to zero.
pub fn parse_remaining(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Ok(n) = value.parse::<i64>() {
        return Some(n.max(0) as u64);
    }
    value
        .parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .map(|f| f.max(0.0) as u64)
}

/// Parse a reset timestamp given as (possibly fractional) epoch seconds.
pub fn parse_reset(value: &str) -> Option<DateTime<Utc>> {
    let secs = value.trim().parse::<f64>().ok().filter(|f| f.is_finite())?;
    let millis = (secs * 1000.0) as i64;
    Utc.timestamp_millis_opt(millis).single()
}

/// Parse a Retry-After value: delay in seconds, or an HTTP date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = when.with_timezone(&Utc) - now;
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}
