//! Config file discovery and parsing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ConfigError, DispatcherConfig, PoolConfig, RateLimitProfile};
use crate::rate_limit::QuotaHeaderNames;

/// Configuration file structure. Every field is optional; unset fields
/// keep the profile's value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<RateLimitProfile>,
    /// Data directory path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    /// Snapshot database filename (relative to the data directory) or path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_db: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxies_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_scope: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries_per_request: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_wait_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_delay_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker_failure_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker_open_duration_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_errors_trip_breaker: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_failures_trip_breaker: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_quota_threshold: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_quota_pause_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inter_request_pause_seconds: Option<f64>,
    /// Upstream header names, if they differ from the defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<QuotaHeaderNames>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_pool_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_poll_interval_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,

    /// Path to the config file this was loaded from (not serialized).
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

fn seconds(key: &str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|e| ConfigError::Invalid {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Option<T> {
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid {}={}", key, raw);
            None
        }
    }
}

impl FileConfig {
    /// Discover a `dropkit` config file in the standard locations.
    /// Falls back to an empty config when none is found or it fails to parse.
    pub async fn load() -> Self {
        match prefer::load("dropkit").await {
            Ok(pref_config) => {
                if let Some(path) = pref_config.source_path() {
                    match Self::load_from_path(path).await {
                        Ok(config) => config,
                        Err(e) => {
                            warn!("Ignoring config file: {}", e);
                            Self::default()
                        }
                    }
                } else {
                    Self::default()
                }
            }
            Err(_) => Self::default(),
        }
    }

    /// Load configuration from a specific file, parsed by extension.
    pub async fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("json");
        let mut config = Self::parse(ext, &contents)?;
        config.source_path = Some(path.to_path_buf());
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Parse config text in the format named by `ext`.
    pub fn parse(ext: &str, contents: &str) -> Result<Self, ConfigError> {
        match ext {
            "toml" => toml::from_str(contents).map_err(|e| ConfigError::Parse {
                format: "TOML",
                message: e.to_string(),
            }),
            "yaml" | "yml" => serde_yaml::from_str(contents).map_err(|e| ConfigError::Parse {
                format: "YAML",
                message: e.to_string(),
            }),
            _ => serde_json::from_str(contents).map_err(|e| ConfigError::Parse {
                format: "JSON",
                message: e.to_string(),
            }),
        }
    }

    /// Apply `DROPKIT_*` variables from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok().filter(|s| !s.is_empty()))
    }

    /// Apply `DROPKIT_*` overrides from an arbitrary lookup.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("DROPKIT_PROFILE") {
            self.profile = parse_env("DROPKIT_PROFILE", &raw).or(self.profile);
        }
        if let Some(raw) = lookup("DROPKIT_DATA_DIR") {
            self.data_dir = Some(raw);
        }
        if let Some(raw) = lookup("DROPKIT_PROXIES_FILE") {
            self.proxies_file = Some(raw);
        }
        if let Some(raw) = lookup("DROPKIT_MAX_RETRIES") {
            self.max_retries_per_request =
                parse_env("DROPKIT_MAX_RETRIES", &raw).or(self.max_retries_per_request);
        }
        if let Some(raw) = lookup("DROPKIT_MAX_WAIT_SECONDS") {
            self.max_wait_seconds =
                parse_env("DROPKIT_MAX_WAIT_SECONDS", &raw).or(self.max_wait_seconds);
        }
        if let Some(raw) = lookup("DROPKIT_WORKER_POOL_SIZE") {
            self.worker_pool_size =
                parse_env("DROPKIT_WORKER_POOL_SIZE", &raw).or(self.worker_pool_size);
        }
        self
    }

    /// Directory of the config file, for resolving relative paths.
    pub fn base_dir(&self) -> Option<PathBuf> {
        self.source_path
            .as_ref()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
    }

    /// Overlay the dispatcher options that are set.
    pub fn apply_to_dispatcher(&self, config: &mut DispatcherConfig) -> Result<(), ConfigError> {
        if let Some(v) = self.max_retries_per_request {
            config.max_retries = v;
        }
        if let Some(v) = self.max_wait_seconds {
            config.max_wait = seconds("max_wait_seconds", v)?;
        }
        if let Some(v) = self.base_delay_seconds {
            config.base_delay = seconds("base_delay_seconds", v)?;
        }
        if let Some(v) = self.circuit_breaker_failure_threshold {
            config.breaker_threshold = v;
        }
        if let Some(v) = self.circuit_breaker_open_duration_seconds {
            config.breaker_duration = seconds("circuit_breaker_open_duration_seconds", v)?;
        }
        if let Some(v) = self.server_errors_trip_breaker {
            config.server_errors_trip_breaker = v;
        }
        if let Some(v) = self.transport_failures_trip_breaker {
            config.transport_failures_trip_breaker = v;
        }
        if let Some(v) = self.low_quota_threshold {
            config.low_quota_threshold = v;
        }
        if let Some(v) = self.low_quota_pause_seconds {
            config.low_quota_pause = seconds("low_quota_pause_seconds", v)?;
        }
        if let Some(v) = self.inter_request_pause_seconds {
            config.inter_request_pause = seconds("inter_request_pause_seconds", v)?;
        }
        if let Some(ref headers) = self.headers {
            config.headers = headers.clone();
        }
        if let Some(ref scope) = self.snapshot_scope {
            config.scope = scope.clone();
        }
        Ok(())
    }

    /// Overlay the pool options that are set.
    pub fn apply_to_pool(&self, config: &mut PoolConfig) -> Result<(), ConfigError> {
        if let Some(v) = self.worker_pool_size {
            if v == 0 {
                return Err(ConfigError::Invalid {
                    key: "worker_pool_size".to_string(),
                    message: "must be at least 1".to_string(),
                });
            }
            config.worker_pool_size = Some(v);
        }
        if let Some(v) = self.task_poll_interval_seconds {
            config.task_poll_interval = seconds("task_poll_interval_seconds", v)?;
        }
        if let Some(v) = self.request_timeout_seconds {
            config.request_timeout = seconds("request_timeout_seconds", v)?;
        }
        if let Some(ref agent) = self.user_agent {
            config.user_agent = Some(agent.clone());
        }
        Ok(())
    }
}
