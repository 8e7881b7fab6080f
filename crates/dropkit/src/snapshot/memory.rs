//! In-memory snapshot store. State is lost when the process exits.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::backend::{RequestLogEntry, SnapshotResult, SnapshotStore};
use super::PersistedSnapshot;

#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<String, PersistedSnapshot>>,
    requests: RwLock<Vec<(String, RequestLogEntry)>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request log entries recorded for a scope, oldest first.
    pub async fn requests(&self, scope: &str) -> Vec<RequestLogEntry> {
        self.requests
            .read()
            .await
            .iter()
            .filter(|(s, _)| s == scope)
            .map(|(_, entry)| entry.clone())
            .collect()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn load(&self, scope: &str) -> SnapshotResult<Option<PersistedSnapshot>> {
        Ok(self.snapshots.read().await.get(scope).cloned())
    }

    async fn save(&self, scope: &str, snapshot: &PersistedSnapshot) -> SnapshotResult<()> {
        self.snapshots
            .write()
            .await
            .insert(scope.to_string(), snapshot.clone());
        Ok(())
    }

    async fn record_request(&self, scope: &str, entry: &RequestLogEntry) -> SnapshotResult<()> {
        self.requests
            .write()
            .await
            .push((scope.to_string(), entry.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::RateLimitState;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_load_missing_scope() {
        let store = InMemorySnapshotStore::new();
        assert!(store.load("default").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let store = InMemorySnapshotStore::new();
        let snapshot =
            PersistedSnapshot::capture(&RateLimitState::new(42), BTreeMap::new(), 1, None);
        store.save("default", &snapshot).await.unwrap();

        let loaded = store.load("default").await.unwrap().unwrap();
        assert_eq!(loaded.remaining, 42);
        assert_eq!(loaded.consecutive_failures, 1);
        assert!(store.load("other").await.unwrap().is_none());
    }
}
