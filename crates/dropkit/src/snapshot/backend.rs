//! Pluggable storage trait for dispatcher snapshots.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::PersistedSnapshot;

/// Result type for snapshot operations.
pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Errors from snapshot backends.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// One executed operation, for the request log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestLogEntry {
    pub timestamp: DateTime<Utc>,
    pub target: Option<String>,
    /// None when the transport failed before a response.
    pub status_code: Option<u16>,
    pub elapsed_ms: u64,
    pub rate_limited: bool,
}

/// Storage for dispatcher snapshots.
///
/// Several dispatchers may write the same scope concurrently; the last
/// write wins.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Load the snapshot for a scope, if one was ever saved.
    async fn load(&self, scope: &str) -> SnapshotResult<Option<PersistedSnapshot>>;

    /// Replace the snapshot for a scope.
    async fn save(&self, scope: &str, snapshot: &PersistedSnapshot) -> SnapshotResult<()>;

    /// Append to the request log. Backends without one ignore it.
    async fn record_request(&self, _scope: &str, _entry: &RequestLogEntry) -> SnapshotResult<()> {
        Ok(())
    }
}
