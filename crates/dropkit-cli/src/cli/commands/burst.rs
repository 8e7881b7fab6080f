//! Purchase burst command.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dropkit::config::Settings;
use dropkit::pool::{HttpPurchaseExecutor, PurchaseTarget, WorkerPool};
use dropkit::snapshot::{SnapshotStore, SqliteSnapshotStore};
use dropkit::IdentityPool;
use tracing::{debug, info};

pub struct BurstArgs {
    pub target: String,
    pub url_template: String,
    pub attempts: u32,
    pub delay_ms: Option<u64>,
    pub timeout: u64,
    pub workers: Option<usize>,
    pub proxies: Option<PathBuf>,
    pub units_header: Option<String>,
    pub headers: Vec<String>,
}

#[derive(Default)]
struct Totals {
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    units: AtomicU32,
}

/// Run a purchase burst and print the aggregate outcome.
pub async fn cmd_burst(settings: &Settings, args: BurstArgs) -> anyhow::Result<()> {
    let target: PurchaseTarget = args.target.parse()?;
    if args.attempts == 0 {
        anyhow::bail!("--attempts must be at least 1");
    }

    settings.ensure_directories()?;
    let store: Arc<dyn SnapshotStore> = Arc::new(SqliteSnapshotStore::new(&settings.snapshot_path)?);

    let proxies_path = args.proxies.unwrap_or_else(|| settings.proxies_file.clone());
    debug!("Reading proxies from {}", proxies_path.display());
    let mut identities = IdentityPool::from_file(&proxies_path)?;
    identities.shuffle();

    let mut executor = HttpPurchaseExecutor::new(&args.url_template, settings.pool.request_timeout)
        .with_user_agent(settings.pool.user_agent.clone());
    if let Some(header) = args.units_header {
        executor = executor.with_units_header(header);
    }
    for header in &args.headers {
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("Invalid header '{}', expected NAME:VALUE", header))?;
        debug!("Adding request header {}", name.trim());
        executor = executor.with_header(name.trim(), value.trim());
    }

    let mut pool_config = settings.pool.clone();
    if args.workers.is_some() {
        pool_config.worker_pool_size = args.workers;
    }

    let totals = Arc::new(Totals::default());
    let sink = totals.clone();
    let mut pool = WorkerPool::new(
        pool_config,
        settings.dispatcher.clone(),
        store,
        Arc::new(executor),
    )
    .on_result(move |result| {
        if result.success {
            sink.succeeded.fetch_add(1, Ordering::Relaxed);
            sink.units.fetch_add(result.units, Ordering::Relaxed);
        } else {
            sink.failed.fetch_add(1, Ordering::Relaxed);
        }
    });

    let workers = pool.initialize(&identities).await;
    println!(
        "Bursting {} attempts at {} with {} worker(s) ({} profile)",
        args.attempts, target, workers, settings.profile
    );

    let started = Instant::now();
    pool.start().await;
    pool.spam(
        target,
        args.attempts,
        args.delay_ms.map(Duration::from_millis),
    )
    .await;
    let finished = pool
        .wait_for_completion(Duration::from_secs(args.timeout))
        .await;
    let status = pool.status();
    pool.stop().await;

    let succeeded = totals.succeeded.load(Ordering::Relaxed);
    let failed = totals.failed.load(Ordering::Relaxed);
    info!(
        "Burst for {} finished: {} succeeded, {} failed",
        target, succeeded, failed
    );
    println!();
    println!("Finished in {:.1}s", started.elapsed().as_secs_f64());
    println!("  Succeeded: {}", succeeded);
    println!("  Failed:    {}", failed);
    println!("  Units:     {}", totals.units.load(Ordering::Relaxed));
    if !finished {
        println!(
            "  Timed out with {} attempt(s) unfinished",
            status.outstanding
        );
    }

    if succeeded == 0 {
        anyhow::bail!("No purchase attempt succeeded");
    }
    Ok(())
}
