//! Worker pool behaviour through the public API.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dropkit::pool::{
    PurchaseError, PurchaseExecutor, PurchaseTarget, WorkerContext, WorkerPool, WorkerResult,
};
use dropkit::snapshot::InMemorySnapshotStore;
use dropkit::transport::{operation, TransportResponse};
use dropkit::{DispatcherConfig, IdentityPool, PoolConfig, ProxyEndpoint, RequestPriority};

/// Fails item 13, succeeds everything else after a short delay.
struct Scripted;

#[async_trait]
impl PurchaseExecutor for Scripted {
    async fn purchase(
        &self,
        _ctx: &WorkerContext,
        target: PurchaseTarget,
    ) -> Result<u32, PurchaseError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if target.item_id == 13 {
            Err(PurchaseError::Other("sold out".into()))
        } else {
            Ok(1)
        }
    }
}

/// Goes through the worker's own dispatcher.
struct ViaDispatcher;

#[async_trait]
impl PurchaseExecutor for ViaDispatcher {
    async fn purchase(
        &self,
        ctx: &WorkerContext,
        _target: PurchaseTarget,
    ) -> Result<u32, PurchaseError> {
        let response = ctx
            .dispatcher
            .execute(
                operation(|| async { Ok(TransportResponse::new(200)) }),
                RequestPriority::Critical,
            )
            .await?;
        Ok(u32::from(response.is_success()))
    }
}

fn config() -> PoolConfig {
    PoolConfig {
        task_poll_interval: Duration::from_millis(50),
        spam_delay: Duration::from_millis(5),
        ..PoolConfig::default()
    }
}

fn proxies(n: usize) -> IdentityPool {
    IdentityPool::from_proxies(
        (0..n)
            .map(|i| ProxyEndpoint::parse(&format!("socks5://10.1.0.{}:1080", i + 1)).unwrap())
            .collect(),
    )
}

fn collecting_pool(
    executor: Arc<dyn PurchaseExecutor>,
) -> (WorkerPool, Arc<Mutex<Vec<WorkerResult>>>) {
    let results = Arc::new(Mutex::new(Vec::new()));
    let sink = results.clone();
    let pool = WorkerPool::new(
        config(),
        DispatcherConfig::for_tests(),
        Arc::new(InMemorySnapshotStore::new()),
        executor,
    )
    .on_result(move |result| sink.lock().unwrap().push(result));
    (pool, results)
}

#[tokio::test]
async fn one_failure_does_not_affect_other_workers() {
    let (mut pool, results) = collecting_pool(Arc::new(Scripted));
    assert_eq!(pool.initialize(&proxies(3)).await, 3);
    pool.start().await;

    pool.add_task(PurchaseTarget::new(1, 13), 0);
    pool.add_task(PurchaseTarget::new(1, 1), 0);
    pool.add_task(PurchaseTarget::new(1, 2), 0);
    assert!(pool.wait_for_completion(Duration::from_secs(5)).await);
    pool.stop().await;

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 3);
    let failed: Vec<_> = results.iter().filter(|r| !r.success).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].task.target.item_id, 13);
    assert_eq!(failed[0].error.as_deref(), Some("sold out"));
    assert_eq!(results.iter().filter(|r| r.success).count(), 2);
}

#[tokio::test]
async fn burst_completes_with_every_result_reported() {
    let (mut pool, results) = collecting_pool(Arc::new(Scripted));
    pool.initialize(&proxies(3)).await;
    pool.start().await;

    let target: PurchaseTarget = "2/19".parse().unwrap();
    let ids = pool.spam(target, 10, None).await;
    assert!(pool.wait_for_completion(Duration::from_secs(10)).await);

    let results = results.lock().unwrap().clone();
    assert_eq!(results.len(), 10);
    let reported: HashSet<_> = results.iter().map(|r| r.task.task_id).collect();
    let expected: HashSet<_> = ids.into_iter().collect();
    assert_eq!(reported, expected);
    assert!(results.iter().all(|r| r.identity.starts_with("socks5://")));

    pool.stop().await;
}

#[tokio::test]
async fn wait_for_completion_honours_timeout() {
    let (mut pool, _results) = collecting_pool(Arc::new(Scripted));
    pool.initialize(&IdentityPool::direct()).await;
    pool.start().await;

    pool.spam(PurchaseTarget::new(3, 3), 10, Some(Duration::ZERO))
        .await;
    let started = Instant::now();
    assert!(!pool.wait_for_completion(Duration::from_millis(60)).await);
    assert!(started.elapsed() < Duration::from_secs(1));

    pool.stop().await;
    assert_eq!(pool.status().outstanding, 0);
}

#[tokio::test]
async fn workers_use_their_own_dispatchers() {
    let (mut pool, results) = collecting_pool(Arc::new(ViaDispatcher));
    pool.initialize(&proxies(2)).await;
    pool.start().await;

    pool.spam(PurchaseTarget::new(5, 6), 4, Some(Duration::ZERO))
        .await;
    assert!(pool.wait_for_completion(Duration::from_secs(5)).await);
    pool.stop().await;

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|r| r.success && r.units == 1));
}

#[tokio::test]
async fn panicking_callback_does_not_stall_the_pool() {
    let calls = Arc::new(Mutex::new(0));
    let seen = calls.clone();
    let mut pool = WorkerPool::new(
        config(),
        DispatcherConfig::for_tests(),
        Arc::new(InMemorySnapshotStore::new()),
        Arc::new(Scripted),
    )
    .on_result(move |_result| {
        let mut calls = seen.lock().unwrap();
        *calls += 1;
        if *calls == 1 {
            drop(calls);
            panic!("callback failed");
        }
    });
    pool.initialize(&IdentityPool::direct()).await;
    pool.start().await;

    pool.spam(PurchaseTarget::new(4, 1), 3, Some(Duration::ZERO))
        .await;
    assert!(pool.wait_for_completion(Duration::from_secs(5)).await);
    assert_eq!(*calls.lock().unwrap(), 3);
    assert_eq!(pool.status().outstanding, 0);

    pool.stop().await;
}
