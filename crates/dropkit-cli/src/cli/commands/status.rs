//! Persisted state inspection.

use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use dropkit::config::Settings;
use dropkit::snapshot::{PersistedSnapshot, RequestLogEntry, SqliteSnapshotStore};

#[derive(Serialize)]
struct ScopeStatus {
    scope: String,
    snapshot: PersistedSnapshot,
    recent_requests: Vec<RequestLogEntry>,
}

/// Print every saved dispatcher snapshot.
pub async fn cmd_status(settings: &Settings, json: bool, recent: usize) -> anyhow::Result<()> {
    if !settings.snapshot_path.exists() {
        if json {
            println!("[]");
        } else {
            println!("No saved state at {}", settings.snapshot_path.display());
        }
        return Ok(());
    }

    debug!("Opening state database {}", settings.snapshot_path.display());
    let store = SqliteSnapshotStore::new(&settings.snapshot_path)?;
    let mut scopes = Vec::new();
    for (scope, snapshot) in store.load_all().await? {
        let recent_requests = store.recent_requests(&scope, recent).await?;
        scopes.push(ScopeStatus {
            scope,
            snapshot,
            recent_requests,
        });
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&scopes)?);
        return Ok(());
    }

    println!("State database: {}", settings.snapshot_path.display());
    if scopes.is_empty() {
        println!("No scopes recorded yet");
    }

    for status in &scopes {
        let state = status.snapshot.rate_limit_state();
        println!();
        println!("[{}]", status.scope);
        println!("  Remaining:    {}", state.remaining);
        match state.reset_at {
            Some(reset_at) => println!("  Resets at:    {}", reset_at.to_rfc3339()),
            None => println!("  Resets at:    unknown"),
        }
        if let Some(retry_after) = state.retry_after {
            println!("  Retry after:  {}s", retry_after.as_secs());
        }
        match status.snapshot.breaker_open_until() {
            Some(until) if until > Utc::now() => {
                println!("  Breaker:      open until {}", until.to_rfc3339())
            }
            _ => println!("  Breaker:      closed"),
        }
        println!(
            "  Failures:     {} consecutive",
            status.snapshot.consecutive_failures
        );
        println!(
            "  Cached:       {} target(s)",
            status.snapshot.validator_cache.len()
        );

        if !status.recent_requests.is_empty() {
            println!("  Recent requests:");
            for entry in &status.recent_requests {
                let code = entry
                    .status_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "---".to_string());
                println!(
                    "    {} {} {:>5}ms {}",
                    entry.timestamp.format("%H:%M:%S"),
                    code,
                    entry.elapsed_ms,
                    entry.target.as_deref().unwrap_or("-")
                );
            }
        }
    }

    Ok(())
}
