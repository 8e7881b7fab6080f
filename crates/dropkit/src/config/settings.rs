//! Resolved application settings.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{
    ConfigError, DispatcherConfig, FileConfig, PoolConfig, RateLimitProfile,
    DEFAULT_PROXIES_FILENAME, DEFAULT_SNAPSHOT_FILENAME,
};

/// Options for loading settings, usually from CLI flags.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Explicit config file path (overrides discovery).
    pub config_path: Option<PathBuf>,
    /// Profile override.
    pub profile: Option<RateLimitProfile>,
    /// Data directory override.
    pub data_dir: Option<PathBuf>,
}

/// Application settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Base data directory.
    pub data_dir: PathBuf,
    /// Snapshot database path.
    pub snapshot_path: PathBuf,
    /// Proxy list, one per line.
    pub proxies_file: PathBuf,
    pub profile: RateLimitProfile,
    pub dispatcher: DispatcherConfig,
    pub pool: PoolConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self::with_data_dir(default_data_dir())
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dropkit")
}

/// Expand `~` and resolve relative paths against `base_dir`.
fn resolve_path(path_str: &str, base_dir: &Path) -> PathBuf {
    let expanded = shellexpand::tilde(path_str);
    let path = Path::new(expanded.as_ref());
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

impl Settings {
    /// Settings with a custom data directory and default everything else.
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        let profile = RateLimitProfile::default();
        Self {
            snapshot_path: data_dir.join(DEFAULT_SNAPSHOT_FILENAME),
            proxies_file: data_dir.join(DEFAULT_PROXIES_FILENAME),
            data_dir,
            profile,
            dispatcher: DispatcherConfig::from_profile(profile),
            pool: PoolConfig::from_profile(profile),
        }
    }

    /// Load settings: profile defaults, then the config file, then
    /// environment, then explicit options.
    pub async fn load(options: &LoadOptions) -> Result<Self, ConfigError> {
        let file = match &options.config_path {
            Some(path) => FileConfig::load_from_path(path).await?,
            None => FileConfig::load().await,
        }
        .with_env_overrides();

        Self::from_file_config(&file, options)
    }

    /// Build settings from an already-loaded config file.
    pub fn from_file_config(file: &FileConfig, options: &LoadOptions) -> Result<Self, ConfigError> {
        let base_dir = file
            .base_dir()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));

        let data_dir = match (&options.data_dir, &file.data_dir) {
            (Some(dir), _) => resolve_path(&dir.to_string_lossy(), &base_dir),
            (None, Some(dir)) => resolve_path(dir, &base_dir),
            (None, None) => default_data_dir(),
        };

        let mut settings = Self::with_data_dir(data_dir);
        settings.profile = options.profile.or(file.profile).unwrap_or_default();
        settings.dispatcher = DispatcherConfig::from_profile(settings.profile);
        settings.pool = PoolConfig::from_profile(settings.profile);

        file.apply_to_dispatcher(&mut settings.dispatcher)?;
        file.apply_to_pool(&mut settings.pool)?;

        if let Some(ref db) = file.snapshot_db {
            settings.snapshot_path = resolve_path(db, &settings.data_dir);
        }
        if let Some(ref proxies) = file.proxies_file {
            settings.proxies_file = resolve_path(proxies, &base_dir);
        }

        debug!(
            "Settings: profile={}, data_dir={}, snapshot={}",
            settings.profile,
            settings.data_dir.display(),
            settings.snapshot_path.display()
        );
        Ok(settings)
    }

    /// Ensure the data directory exists.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.data_dir).map_err(|e| {
            std::io::Error::new(
                e.kind(),
                format!(
                    "Failed to create data directory '{}': {}",
                    self.data_dir.display(),
                    e
                ),
            )
        })
    }
}
