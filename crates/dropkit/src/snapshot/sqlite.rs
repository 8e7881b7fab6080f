//! SQLite snapshot store.
//!
//! One row per scope in `rate_limit_snapshot`, replaced on every save, plus
//! an append-only `request_log`. Connections are opened per call with WAL
//! and a busy timeout so several processes can share the file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::backend::{RequestLogEntry, SnapshotError, SnapshotResult, SnapshotStore};
use super::PersistedSnapshot;

/// Open a database connection with proper concurrency settings.
fn open_db(db_path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA busy_timeout = 30000;
    "#,
    )?;
    Ok(conn)
}

fn init_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS rate_limit_snapshot (
            scope TEXT PRIMARY KEY,
            schema_version INTEGER NOT NULL,
            remaining INTEGER NOT NULL,
            reset_at REAL NOT NULL DEFAULT 0,
            retry_after INTEGER,
            last_updated REAL NOT NULL DEFAULT 0,
            consecutive_failures INTEGER NOT NULL DEFAULT 0,
            breaker_open_until REAL,
            validator_cache TEXT NOT NULL DEFAULT '{}',
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );
        CREATE TABLE IF NOT EXISTS request_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            scope TEXT NOT NULL,
            timestamp REAL NOT NULL,
            target TEXT,
            status_code INTEGER,
            elapsed_ms INTEGER NOT NULL,
            rate_limited INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_request_log_scope ON request_log(scope, timestamp);
    "#,
    )
}

const SELECT_SNAPSHOT: &str = r#"SELECT scope, schema_version, remaining, reset_at, retry_after,
       last_updated, consecutive_failures, breaker_open_until, validator_cache
  FROM rate_limit_snapshot"#;

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, PersistedSnapshot, String)> {
    Ok((
        row.get::<_, String>(0)?,
        PersistedSnapshot {
            schema_version: row.get::<_, i64>(1)? as u32,
            remaining: row.get::<_, i64>(2)?.max(0) as u64,
            reset_at: row.get(3)?,
            retry_after: row.get::<_, Option<i64>>(4)?.map(|v| v.max(0) as u64),
            last_updated: row.get(5)?,
            validator_cache: Default::default(),
            consecutive_failures: row.get::<_, i64>(6)?.max(0) as u32,
            breaker_open_until: row.get(7)?,
        },
        row.get::<_, String>(8)?,
    ))
}

fn with_cache(
    (scope, mut snapshot, cache_json): (String, PersistedSnapshot, String),
) -> SnapshotResult<(String, PersistedSnapshot)> {
    snapshot.validator_cache = serde_json::from_str(&cache_json)?;
    Ok((scope, snapshot))
}

/// Snapshot store backed by a SQLite file.
#[derive(Debug, Clone)]
pub struct SqliteSnapshotStore {
    db_path: PathBuf,
}

impl SqliteSnapshotStore {
    /// Open (creating if needed) the database at `db_path`.
    pub fn new(db_path: impl Into<PathBuf>) -> SnapshotResult<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = open_db(&db_path)?;
        init_tables(&conn)?;
        debug!("Snapshot store ready at {}", db_path.display());
        Ok(Self { db_path })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    async fn with_conn<F, T>(&self, f: F) -> SnapshotResult<T>
    where
        F: FnOnce(&Connection) -> SnapshotResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_db(&db_path)?;
            f(&conn)
        })
        .await
        .map_err(|e| SnapshotError::Unavailable(e.to_string()))?
    }

    /// Every stored snapshot, ordered by scope.
    pub async fn load_all(&self) -> SnapshotResult<Vec<(String, PersistedSnapshot)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{} ORDER BY scope", SELECT_SNAPSHOT))?;
            let rows = stmt.query_map([], row_to_snapshot)?;
            let mut snapshots = Vec::new();
            for row in rows {
                snapshots.push(with_cache(row?)?);
            }
            Ok(snapshots)
        })
        .await
    }

    /// Most recent request log entries for a scope, newest first.
    pub async fn recent_requests(
        &self,
        scope: &str,
        limit: usize,
    ) -> SnapshotResult<Vec<RequestLogEntry>> {
        let scope = scope.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                r#"SELECT timestamp, target, status_code, elapsed_ms, rate_limited
                     FROM request_log
                    WHERE scope = ?
                    ORDER BY id DESC
                    LIMIT ?"#,
            )?;
            let rows = stmt.query_map(params![scope, limit as i64], |row| {
                let ts: f64 = row.get(0)?;
                Ok(RequestLogEntry {
                    timestamp: Utc
                        .timestamp_millis_opt((ts * 1000.0).round() as i64)
                        .single()
                        .unwrap_or_default(),
                    target: row.get(1)?,
                    status_code: row.get::<_, Option<i64>>(2)?.map(|s| s as u16),
                    elapsed_ms: row.get::<_, i64>(3)?.max(0) as u64,
                    rate_limited: row.get::<_, i64>(4)? != 0,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>().map_err(SnapshotError::from)
        })
        .await
    }
}

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    async fn load(&self, scope: &str) -> SnapshotResult<Option<PersistedSnapshot>> {
        let scope = scope.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!("{} WHERE scope = ?", SELECT_SNAPSHOT),
                    params![scope],
                    row_to_snapshot,
                )
                .optional()?;
            row.map(with_cache)
                .transpose()
                .map(|found| found.map(|(_, snapshot)| snapshot))
        })
        .await
    }

    async fn save(&self, scope: &str, snapshot: &PersistedSnapshot) -> SnapshotResult<()> {
        let scope = scope.to_string();
        let snapshot = snapshot.clone();
        self.with_conn(move |conn| {
            let cache_json = serde_json::to_string(&snapshot.validator_cache)?;
            conn.execute(
                r#"INSERT OR REPLACE INTO rate_limit_snapshot
                   (scope, schema_version, remaining, reset_at, retry_after, last_updated,
                    consecutive_failures, breaker_open_until, validator_cache, updated_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)"#,
                params![
                    scope,
                    snapshot.schema_version as i64,
                    snapshot.remaining.min(i64::MAX as u64) as i64,
                    snapshot.reset_at,
                    snapshot.retry_after.map(|v| v.min(i64::MAX as u64) as i64),
                    snapshot.last_updated,
                    snapshot.consecutive_failures as i64,
                    snapshot.breaker_open_until,
                    cache_json,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn record_request(&self, scope: &str, entry: &RequestLogEntry) -> SnapshotResult<()> {
        let scope = scope.to_string();
        let entry = entry.clone();
        self.with_conn(move |conn| {
            conn.execute(
                r#"INSERT INTO request_log
                   (scope, timestamp, target, status_code, elapsed_ms, rate_limited)
                   VALUES (?, ?, ?, ?, ?, ?)"#,
                params![
                    scope,
                    entry.timestamp.timestamp_millis() as f64 / 1000.0,
                    entry.target,
                    entry.status_code.map(i64::from),
                    entry.elapsed_ms.min(i64::MAX as u64) as i64,
                    entry.rate_limited as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }
}
