//! Configuration for the dispatcher and worker pool.
//!
//! Typed configs are built from a [`RateLimitProfile`], then overridden by
//! a config file discovered with `prefer`, then by `DROPKIT_*` environment
//! variables.

mod file;
mod profile;
mod settings;

pub use file::FileConfig;
pub use profile::{ProfileSettings, RateLimitProfile};
pub use settings::{LoadOptions, Settings};

use std::time::Duration;

use crate::rate_limit::{BackoffPolicy, QuotaHeaderNames, DEFAULT_INITIAL_REMAINING};
use crate::snapshot::DEFAULT_SCOPE;

/// Default snapshot database filename.
pub const DEFAULT_SNAPSHOT_FILENAME: &str = "dropkit.db";

/// Default proxies filename inside the data directory.
pub const DEFAULT_PROXIES_FILENAME: &str = "proxies.txt";

/// Upper bound on workers when the pool size is derived from identities.
pub const DEFAULT_MAX_WORKERS: usize = 10;

/// Errors from loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse {format} config: {message}")]
    Parse { format: &'static str, message: String },
    #[error("Invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

/// Dispatcher tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    /// Retries allowed per request after the first attempt.
    pub max_retries: u32,
    /// Upper bound for any single wait (backoff, quota reset, low-quota pause).
    pub max_wait: Duration,
    /// Base of the exponential backoff.
    pub base_delay: Duration,
    pub breaker_threshold: u32,
    pub breaker_duration: Duration,
    /// At or below this many remaining requests, pause before each request.
    pub low_quota_threshold: u64,
    pub low_quota_pause: Duration,
    /// Pause between consecutive executions.
    pub inter_request_pause: Duration,
    /// Quota assumed until the upstream reports one.
    pub initial_remaining: u64,
    /// Count 5xx responses toward the breaker.
    pub server_errors_trip_breaker: bool,
    /// Count network failures toward the breaker.
    pub transport_failures_trip_breaker: bool,
    pub headers: QuotaHeaderNames,
    /// Snapshot key. Dispatchers sharing a scope share persisted state.
    pub scope: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from_profile(RateLimitProfile::default())
    }
}

impl DispatcherConfig {
    pub fn from_profile(profile: RateLimitProfile) -> Self {
        let preset = profile.settings();
        Self {
            max_retries: preset.max_retries,
            max_wait: preset.max_wait,
            base_delay: Duration::from_secs(1),
            breaker_threshold: preset.breaker_threshold,
            breaker_duration: preset.breaker_duration,
            low_quota_threshold: 10,
            low_quota_pause: preset.low_quota_pause,
            inter_request_pause: Duration::from_millis(100),
            initial_remaining: DEFAULT_INITIAL_REMAINING,
            server_errors_trip_breaker: false,
            transport_failures_trip_breaker: false,
            headers: QuotaHeaderNames::default(),
            scope: DEFAULT_SCOPE.to_string(),
        }
    }

    /// Short waits so tests and dry runs finish quickly.
    pub fn for_tests() -> Self {
        Self {
            max_wait: Duration::from_millis(200),
            base_delay: Duration::from_millis(10),
            breaker_duration: Duration::from_millis(200),
            low_quota_pause: Duration::from_millis(20),
            inter_request_pause: Duration::from_millis(1),
            ..Self::default()
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.base_delay, self.max_wait)
    }
}

/// Worker pool tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Fixed worker count. None = one per identity, capped at `max_workers`.
    pub worker_pool_size: Option<usize>,
    pub max_workers: usize,
    /// How long an idle worker waits on the queue before checking for stop.
    pub task_poll_interval: Duration,
    /// Default delay between enqueues in a burst.
    pub spam_delay: Duration,
    /// Per-request timeout for the HTTP transport.
    pub request_timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: None,
            max_workers: DEFAULT_MAX_WORKERS,
            task_poll_interval: Duration::from_secs(1),
            spam_delay: Duration::from_millis(100),
            request_timeout: RateLimitProfile::default().settings().request_timeout,
            user_agent: None,
        }
    }
}

impl PoolConfig {
    pub fn from_profile(profile: RateLimitProfile) -> Self {
        Self {
            request_timeout: profile.settings().request_timeout,
            ..Self::default()
        }
    }

    /// Number of workers to run for `available_identities`. Never zero.
    pub fn worker_count(&self, available_identities: usize) -> usize {
        match self.worker_pool_size {
            Some(size) => size.max(1),
            None => available_identities.min(self.max_workers).max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_drives_dispatcher_config() {
        let config = DispatcherConfig::from_profile(RateLimitProfile::Extreme);
        assert_eq!(config.max_wait, Duration::from_secs(15));
        assert_eq!(config.breaker_threshold, 10);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.low_quota_threshold, 10);
        assert_eq!(config.scope, "default");
    }

    #[test]
    fn test_worker_count() {
        let pool = PoolConfig::default();
        assert_eq!(pool.worker_count(0), 1);
        assert_eq!(pool.worker_count(4), 4);
        assert_eq!(pool.worker_count(25), 10);

        let fixed = PoolConfig {
            worker_pool_size: Some(3),
            ..PoolConfig::default()
        };
        assert_eq!(fixed.worker_count(25), 3);
    }
}
