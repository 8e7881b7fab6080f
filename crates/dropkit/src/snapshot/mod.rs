//! Durable dispatcher state.
//!
//! A [`PersistedSnapshot`] is written after every state change and read once
//! when a dispatcher starts, so a restart does not forget an active quota
//! penalty. Backends:
//! - In-memory (tests, ephemeral runs)
//! - SQLite (single host, shared between processes)

mod backend;
mod memory;
mod sqlite;

pub use backend::{RequestLogEntry, SnapshotError, SnapshotResult, SnapshotStore};
pub use memory::InMemorySnapshotStore;
pub use sqlite::SqliteSnapshotStore;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::rate_limit::{RateLimitState, Validators};

/// Layout version written with every snapshot.
pub const SCHEMA_VERSION: u32 = 2;

/// Scope used when a dispatcher is not given one.
pub const DEFAULT_SCOPE: &str = "default";

/// Serialized copy of a dispatcher's throttling state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    pub schema_version: u32,
    pub remaining: u64,
    /// Epoch seconds, 0 when unknown.
    pub reset_at: f64,
    /// Seconds, if the last response carried a retry-after.
    pub retry_after: Option<u64>,
    /// Epoch seconds, 0 when never updated.
    pub last_updated: f64,
    #[serde(default)]
    pub validator_cache: BTreeMap<String, Validators>,
    #[serde(default)]
    pub consecutive_failures: u32,
    /// Epoch seconds.
    #[serde(default)]
    pub breaker_open_until: Option<f64>,
}

impl PersistedSnapshot {
    /// Capture the current state.
    pub fn capture(
        state: &RateLimitState,
        validator_cache: BTreeMap<String, Validators>,
        consecutive_failures: u32,
        breaker_open_until: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            remaining: state.remaining,
            reset_at: state.reset_at.map(to_epoch).unwrap_or(0.0),
            retry_after: state.retry_after.map(|d| d.as_secs()),
            last_updated: state.last_updated.map(to_epoch).unwrap_or(0.0),
            validator_cache,
            consecutive_failures,
            breaker_open_until: breaker_open_until.map(to_epoch),
        }
    }

    /// Rebuild the quota state this snapshot describes.
    pub fn rate_limit_state(&self) -> RateLimitState {
        RateLimitState {
            remaining: self.remaining,
            reset_at: from_epoch(self.reset_at),
            retry_after: self.retry_after.map(Duration::from_secs),
            last_updated: from_epoch(self.last_updated),
        }
    }

    pub fn breaker_open_until(&self) -> Option<DateTime<Utc>> {
        self.breaker_open_until.and_then(from_epoch)
    }

    /// Whether this build knows how to read the snapshot.
    pub fn is_compatible(&self) -> bool {
        self.schema_version <= SCHEMA_VERSION
    }
}

fn to_epoch(dt: DateTime<Utc>) -> f64 {
    dt.timestamp_millis() as f64 / 1000.0
}

fn from_epoch(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() || secs <= 0.0 {
        return None;
    }
    Utc.timestamp_millis_opt((secs * 1000.0).round() as i64).single()
}
