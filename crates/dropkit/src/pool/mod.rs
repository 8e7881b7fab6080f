//! Concurrent purchase fan-out.
//!
//! A fixed set of workers, each with its own dispatcher and egress identity,
//! consume purchase tasks from one shared queue. A failed task is reported
//! as a [`WorkerResult`] and never stops other workers; the pool does not
//! retry on its own.

mod executor;
mod queue;
mod task;
mod worker;

pub use executor::{HttpPurchaseExecutor, PurchaseError, PurchaseExecutor, WorkerContext};
pub use task::{PurchaseTarget, PurchaseTask, TargetParseError, WorkerResult};
pub use worker::ResultCallback;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{DispatcherConfig, PoolConfig};
use crate::dispatcher::Dispatcher;
use crate::egress::{self, EgressIdentity, IdentityPool};
use crate::snapshot::SnapshotStore;
use queue::TaskQueue;
use worker::Shared;

/// Point-in-time view of the pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStatus {
    pub running: bool,
    pub total_workers: usize,
    /// Workers currently executing a task.
    pub active_workers: usize,
    /// Tasks waiting to be picked up.
    pub queue_size: usize,
    /// Tasks enqueued but not yet finished.
    pub outstanding: usize,
    /// Workers per egress identity label.
    pub identities: BTreeMap<String, usize>,
}

pub struct WorkerPool {
    config: PoolConfig,
    dispatcher_config: DispatcherConfig,
    store: Arc<dyn SnapshotStore>,
    executor: Arc<dyn PurchaseExecutor>,
    callback: Option<ResultCallback>,
    queue: Arc<TaskQueue>,
    /// Workers built by `initialize` and not yet started.
    pending: Vec<WorkerContext>,
    identities: Vec<EgressIdentity>,
    shared: Option<Arc<Shared>>,
    shutdown: Option<watch::Sender<bool>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(
        config: PoolConfig,
        dispatcher_config: DispatcherConfig,
        store: Arc<dyn SnapshotStore>,
        executor: Arc<dyn PurchaseExecutor>,
    ) -> Self {
        Self {
            config,
            dispatcher_config,
            store,
            executor,
            callback: None,
            queue: Arc::new(TaskQueue::default()),
            pending: Vec::new(),
            identities: Vec::new(),
            shared: None,
            shutdown: None,
            handles: Vec::new(),
        }
    }

    /// Register the callback that receives every [`WorkerResult`].
    pub fn on_result<F>(mut self, callback: F) -> Self
    where
        F: Fn(WorkerResult) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Build one worker per identity, up to the configured size.
    ///
    /// With no proxies a single direct worker is created. A fixed
    /// `worker_pool_size` larger than the identity count reuses identities
    /// round-robin. Returns the worker count.
    pub async fn initialize(&mut self, identities: &IdentityPool) -> usize {
        if self.is_running() {
            warn!("Worker pool already running; ignoring initialize");
            return self.identities.len();
        }

        let available = identities.identities(self.config.max_workers.max(1));
        let count = self.config.worker_count(if identities.is_empty() {
            1
        } else {
            available.len()
        });

        let assigned = available.iter().cycle().take(count).cloned().collect();
        self.build_workers(assigned).await;

        let proxied = self.identities.iter().filter(|i| i.is_proxy()).count();
        info!(
            "Initialized {} workers ({} proxied, {} direct)",
            count,
            proxied,
            count - proxied
        );
        for (label, workers) in egress::distribution(&self.identities) {
            info!("  {}: {} worker(s)", label, workers);
        }

        count
    }

    /// One worker context, with a fresh dispatcher, per assigned identity.
    async fn build_workers(&mut self, identities: Vec<EgressIdentity>) {
        self.pending.clear();
        for (worker_id, identity) in identities.iter().enumerate() {
            let dispatcher =
                Dispatcher::new(self.dispatcher_config.clone(), self.store.clone()).await;
            self.pending.push(WorkerContext {
                worker_id,
                identity: identity.clone(),
                dispatcher,
            });
        }
        self.identities = identities;
    }

    /// Launch the worker loops. After a `stop`, workers are rebuilt on the
    /// same identities. Initializes with a direct identity first if
    /// `initialize` was never called.
    pub async fn start(&mut self) {
        if self.is_running() {
            warn!("Worker pool already running");
            return;
        }
        if self.pending.is_empty() {
            if self.identities.is_empty() {
                self.initialize(&IdentityPool::direct()).await;
            } else {
                debug!(
                    "Rebuilding {} workers on their previous identities",
                    self.identities.len()
                );
                let identities = self.identities.clone();
                self.build_workers(identities).await;
            }
        }

        let shared = Arc::new(Shared {
            queue: self.queue.clone(),
            executor: self.executor.clone(),
            callback: self.callback.clone(),
            active: AtomicUsize::new(0),
            poll_interval: self.config.task_poll_interval,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        for ctx in self.pending.drain(..) {
            self.handles.push(tokio::spawn(worker::run(
                ctx,
                shared.clone(),
                shutdown_rx.clone(),
            )));
        }

        info!("Started {} workers", self.handles.len());
        self.shared = Some(shared);
        self.shutdown = Some(shutdown_tx);
    }

    /// Enqueue one purchase attempt. Lower priority values run first.
    pub fn add_task(&self, target: PurchaseTarget, priority: u32) -> Uuid {
        let task = PurchaseTask::new(target, priority);
        let task_id = task.task_id;
        self.queue.push(task);
        task_id
    }

    /// Enqueue `total_attempts` tasks for one target, pausing `delay`
    /// between enqueues. Earlier attempts keep precedence.
    pub async fn spam(
        &self,
        target: PurchaseTarget,
        total_attempts: u32,
        delay: Option<Duration>,
    ) -> Vec<Uuid> {
        let delay = delay.unwrap_or(self.config.spam_delay);
        info!("Queueing {} attempts for {}", total_attempts, target);

        let mut ids = Vec::with_capacity(total_attempts as usize);
        for i in 0..total_attempts {
            ids.push(self.add_task(target, i));
            if i + 1 < total_attempts && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        ids
    }

    /// Wait until every enqueued task has been processed and reported.
    /// Returns false if `timeout` elapsed first.
    pub async fn wait_for_completion(&self, timeout: Duration) -> bool {
        let drained = self.queue.wait_drained(timeout).await;
        if !drained {
            warn!(
                "Timed out with {} task(s) outstanding",
                self.queue.outstanding()
            );
        }
        drained
    }

    /// Stop all workers. Idle workers exit at once, busy ones after their
    /// current task. Tasks still queued are discarded.
    pub async fn stop(&mut self) {
        let Some(shutdown) = self.shutdown.take() else {
            return;
        };
        shutdown.send_replace(true);

        let discarded = self.queue.drain();
        if !discarded.is_empty() {
            info!("Discarded {} queued task(s)", discarded.len());
        }

        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                warn!("Worker ended abnormally: {}", e);
            }
        }
        self.shared = None;
        debug!("Worker pool stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shutdown.is_some()
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            running: self.is_running(),
            total_workers: self.identities.len(),
            active_workers: self
                .shared
                .as_ref()
                .map(|s| s.active.load(Ordering::SeqCst))
                .unwrap_or(0),
            queue_size: self.queue.len(),
            outstanding: self.queue.outstanding(),
            identities: egress::distribution(&self.identities),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::egress::ProxyEndpoint;
    use crate::snapshot::InMemorySnapshotStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct OneUnit;

    #[async_trait]
    impl PurchaseExecutor for OneUnit {
        async fn purchase(
            &self,
            _ctx: &WorkerContext,
            _target: PurchaseTarget,
        ) -> Result<u32, PurchaseError> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(1)
        }
    }

    fn pool(config: PoolConfig) -> WorkerPool {
        WorkerPool::new(
            config,
            DispatcherConfig::for_tests(),
            Arc::new(InMemorySnapshotStore::new()),
            Arc::new(OneUnit),
        )
    }

    fn fast_config() -> PoolConfig {
        PoolConfig {
            task_poll_interval: Duration::from_millis(20),
            spam_delay: Duration::from_millis(1),
            ..PoolConfig::default()
        }
    }

    fn proxies(n: usize) -> IdentityPool {
        IdentityPool::from_proxies(
            (0..n)
                .map(|i| ProxyEndpoint::parse(&format!("10.0.0.{}:8080", i + 1)).unwrap())
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_initialize_without_proxies_uses_one_direct_worker() {
        let mut pool = pool(fast_config());
        assert_eq!(pool.initialize(&IdentityPool::direct()).await, 1);
        let status = pool.status();
        assert_eq!(status.total_workers, 1);
        assert_eq!(status.identities.get("direct"), Some(&1));
        assert!(!status.running);
    }

    #[tokio::test]
    async fn test_initialize_caps_at_max_workers() {
        let mut pool = pool(PoolConfig {
            max_workers: 3,
            ..fast_config()
        });
        assert_eq!(pool.initialize(&proxies(5)).await, 3);
        assert_eq!(pool.status().identities.len(), 3);
    }

    #[tokio::test]
    async fn test_fixed_size_reuses_identities() {
        let mut pool = pool(PoolConfig {
            worker_pool_size: Some(4),
            ..fast_config()
        });
        assert_eq!(pool.initialize(&proxies(2)).await, 4);
        let identities = pool.status().identities;
        assert_eq!(identities.len(), 2);
        assert!(identities.values().all(|&n| n == 2));
    }

    #[tokio::test]
    async fn test_spam_reports_every_attempt() {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        let mut pool = pool(fast_config()).on_result(move |r| {
            sink.lock().unwrap().push(r);
        });
        pool.initialize(&proxies(3)).await;
        pool.start().await;
        assert!(pool.status().running);

        let ids = pool.spam(PurchaseTarget::new(2, 19), 6, None).await;
        assert_eq!(ids.len(), 6);
        assert!(pool.wait_for_completion(Duration::from_secs(5)).await);

        let results = results.lock().unwrap().clone();
        assert_eq!(results.len(), 6);
        assert!(results.iter().all(|r| r.success && r.units == 1));

        pool.stop().await;
        let status = pool.status();
        assert!(!status.running);
        assert_eq!(status.outstanding, 0);
    }

    #[tokio::test]
    async fn test_stop_discards_queued_tasks() {
        let mut pool = pool(fast_config());
        for i in 0..5 {
            pool.add_task(PurchaseTarget::new(1, i), 0);
        }
        assert_eq!(pool.status().queue_size, 5);

        pool.start().await;
        pool.stop().await;
        let status = pool.status();
        assert_eq!(status.queue_size, 0);
        assert_eq!(status.outstanding, 0);
        assert!(pool.wait_for_completion(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_restart_keeps_proxies() {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        let mut pool = pool(fast_config()).on_result(move |r| {
            sink.lock().unwrap().push(r);
        });
        pool.initialize(&proxies(2)).await;
        pool.start().await;
        pool.stop().await;

        pool.start().await;
        let status = pool.status();
        assert_eq!(status.total_workers, 2);
        assert_eq!(status.identities.get("direct"), None);

        pool.spam(PurchaseTarget::new(2, 19), 4, None).await;
        assert!(pool.wait_for_completion(Duration::from_secs(5)).await);
        pool.stop().await;

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.identity.starts_with("http://10.0.0.")));
    }

    #[tokio::test]
    async fn test_wait_for_completion_times_out() {
        let pool = pool(fast_config());
        pool.add_task(PurchaseTarget::new(1, 1), 0);
        assert!(!pool.wait_for_completion(Duration::from_millis(30)).await);
    }
}
