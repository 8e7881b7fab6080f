//! Adaptive rate-limited request dispatcher.
//!
//! Callers submit operations with a priority. A single background loop per
//! dispatcher pops the highest-priority, oldest item, waits out any breaker
//! cool-down or quota shortage, runs the operation, updates throttling state
//! from the response, and then resolves the caller or schedules a retry.

mod error;
mod metrics;
mod queue;

pub use error::{AttemptFailure, DispatchError};
pub use metrics::DispatcherMetrics;
pub use queue::{RequestOptions, RequestPriority};

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::DispatcherConfig;
use crate::rate_limit::{
    BackoffPolicy, CircuitBreaker, ConditionalCacheStore, RateLimitState, Validators,
};
use crate::snapshot::{InMemorySnapshotStore, PersistedSnapshot, RequestLogEntry, SnapshotStore};
use crate::sync::{lock, stopped};
use crate::transport::{Operation, TransportError, TransportResponse};
use queue::{Next, RequestItem, RequestQueue};

/// Handle to a submitted request. Resolves once the request succeeds or
/// fails for good.
#[must_use = "a pending result does nothing unless awaited"]
pub struct PendingResult {
    rx: oneshot::Receiver<Result<TransportResponse, DispatchError>>,
}

impl Future for PendingResult {
    type Output = Result<TransportResponse, DispatchError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(DispatchError::Closed)))
    }
}

/// How a response is handled.
enum Verdict {
    Success,
    Unauthorized,
    Retry(AttemptFailure),
}

/// Throttling state owned by the dispatch loop.
struct Core {
    state: RateLimitState,
    breaker: CircuitBreaker,
    cache: ConditionalCacheStore,
    in_flight: bool,
}

impl Core {
    fn new(config: &DispatcherConfig) -> Self {
        Self {
            state: RateLimitState::new(config.initial_remaining),
            breaker: CircuitBreaker::new(config.breaker_threshold, config.breaker_duration),
            cache: ConditionalCacheStore::new(),
            in_flight: false,
        }
    }

    fn restore(&mut self, snapshot: &PersistedSnapshot) {
        self.state = snapshot.rate_limit_state();
        self.cache = snapshot.validator_cache.clone().into();
        self.breaker
            .restore(snapshot.consecutive_failures, snapshot.breaker_open_until());
    }

    fn snapshot(&self) -> PersistedSnapshot {
        PersistedSnapshot::capture(
            &self.state,
            self.cache.entries().clone(),
            self.breaker.consecutive_failures(),
            self.breaker.open_until(),
        )
    }
}

struct Inner {
    config: DispatcherConfig,
    backoff: BackoffPolicy,
    store: Arc<dyn SnapshotStore>,
    core: Mutex<Core>,
    queue: Mutex<RequestQueue>,
    wakeup: Notify,
    seq: AtomicU64,
}

/// Stops the loop when the last dispatcher handle goes away.
struct LoopHandle {
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for LoopHandle {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// Rate-limited request dispatcher. Cheap to clone; clones share one queue
/// and one dispatch loop.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
    handle: Arc<LoopHandle>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("scope", &self.inner.config.scope)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher, restoring any snapshot saved under the config's
    /// scope, and start its dispatch loop. Must be called inside a Tokio runtime.
    pub async fn new(config: DispatcherConfig, store: Arc<dyn SnapshotStore>) -> Self {
        let mut core = Core::new(&config);
        match store.load(&config.scope).await {
            Ok(Some(snapshot)) if snapshot.is_compatible() => {
                core.restore(&snapshot);
                info!(
                    "Loaded rate limit state for '{}': {} remaining",
                    config.scope, core.state.remaining
                );
            }
            Ok(Some(snapshot)) => warn!(
                "Ignoring rate limit snapshot with newer schema version {}",
                snapshot.schema_version
            ),
            Ok(None) => {}
            Err(e) => warn!("Failed to load rate limit state: {}", e),
        }

        let inner = Arc::new(Inner {
            backoff: config.backoff_policy(),
            config,
            store,
            core: Mutex::new(core),
            queue: Mutex::new(RequestQueue::default()),
            wakeup: Notify::new(),
            seq: AtomicU64::new(0),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(Inner::run(inner.clone(), shutdown_rx));

        Self {
            inner,
            handle: Arc::new(LoopHandle {
                shutdown: shutdown_tx,
                task: Mutex::new(Some(task)),
            }),
        }
    }

    /// Dispatcher whose state is kept in memory only.
    pub async fn in_memory(config: DispatcherConfig) -> Self {
        Self::new(config, Arc::new(InMemorySnapshotStore::new())).await
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Enqueue an operation and return a handle to its outcome.
    pub fn submit(&self, operation: Operation, options: impl Into<RequestOptions>) -> PendingResult {
        let options = options.into();
        let (tx, rx) = oneshot::channel();
        let item = RequestItem {
            priority: options.priority,
            operation,
            responder: tx,
            created_at: Instant::now(),
            seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
            retries: 0,
            max_retries: options.max_retries.unwrap_or(self.inner.config.max_retries),
            target: options.target,
        };

        let rejected = lock(&self.inner.queue).push(item).err();
        match rejected {
            Some(item) => item.resolve(Err(DispatchError::Closed)),
            None => self.inner.wakeup.notify_one(),
        }
        PendingResult { rx }
    }

    /// Run an operation through the queue and wait for its outcome.
    pub async fn execute(
        &self,
        operation: Operation,
        options: impl Into<RequestOptions>,
    ) -> Result<TransportResponse, DispatchError> {
        self.submit(operation, options).await
    }

    /// `If-None-Match` / `If-Modified-Since` headers for a target, empty if
    /// nothing is cached.
    pub fn conditional_headers(&self, target: &str) -> HashMap<String, String> {
        lock(&self.inner.core).cache.conditional_headers(target)
    }

    pub fn validators(&self, target: &str) -> Option<Validators> {
        lock(&self.inner.core).cache.get(target).cloned()
    }

    /// Store validators for a target and persist them.
    pub async fn put_validators(&self, target: &str, validators: Validators) {
        let snapshot = {
            let mut core = lock(&self.inner.core);
            core.cache.put(target, validators);
            core.snapshot()
        };
        self.inner.persist(&snapshot).await;
    }

    /// Update quota and breaker state from a response obtained elsewhere.
    pub async fn update_from_response(&self, headers: &HashMap<String, String>, status: u16) {
        let snapshot = self.inner.apply_response(headers, status, None);
        self.inner.persist(&snapshot).await;
    }

    pub fn metrics(&self) -> DispatcherMetrics {
        let now = Utc::now();
        let queue_size = lock(&self.inner.queue).len();
        let core = lock(&self.inner.core);
        DispatcherMetrics {
            scope: self.inner.config.scope.clone(),
            state: core.state.clone(),
            breaker: core.breaker.status(now),
            queue_size,
            in_flight: core.in_flight,
            cache_entries: core.cache.len(),
        }
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.queue).is_closed()
    }

    /// Stop the dispatch loop. An in-flight operation finishes first; queued
    /// requests fail with [`DispatchError::Closed`].
    pub async fn shutdown(&self) {
        self.handle.shutdown.send_replace(true);
        let task = lock(&self.handle.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Dispatch loop ended abnormally: {}", e);
            }
        }
    }
}

impl Inner {
    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        debug!("Dispatch loop started for '{}'", self.config.scope);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = lock(&self.queue).pop(Instant::now());
            match next {
                Next::Ready(item) => {
                    if self.process(item, &mut shutdown).await {
                        break;
                    }
                    if self.pause(self.config.inter_request_pause, &mut shutdown).await {
                        break;
                    }
                }
                Next::WaitUntil(deadline) => {
                    tokio::select! {
                        _ = self.wakeup.notified() => {}
                        _ = tokio::time::sleep_until(deadline.into()) => {}
                        _ = stopped(&mut shutdown) => break,
                    }
                }
                Next::Idle => {
                    tokio::select! {
                        _ = self.wakeup.notified() => {}
                        _ = stopped(&mut shutdown) => break,
                    }
                }
            }
        }

        let abandoned = lock(&self.queue).close();
        if !abandoned.is_empty() {
            debug!("Rejecting {} queued requests on shutdown", abandoned.len());
        }
        for item in abandoned {
            item.resolve(Err(DispatchError::Closed));
        }
        debug!("Dispatch loop stopped for '{}'", self.config.scope);
    }

    /// Sleep unless shutdown comes first. Returns true on shutdown.
    async fn pause(&self, duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        if duration.is_zero() {
            return *shutdown.borrow();
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = stopped(shutdown) => true,
        }
    }

    /// Wait out an open breaker, an exhausted quota, or a low quota.
    /// Returns true if shutdown interrupted the wait.
    async fn throttle(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let now = Utc::now();
        let (cooldown, exhausted, until_reset, remaining) = {
            let core = lock(&self.core);
            (
                core.breaker.cooldown(now),
                core.state.is_exhausted(now),
                core.state.until_reset(now),
                core.state.remaining,
            )
        };
        let max_wait = self.config.max_wait;

        if let Some(wait) = cooldown {
            warn!(
                "Circuit breaker active, waiting {:.1}s",
                wait.as_secs_f64()
            );
            return self.pause(wait, shutdown).await;
        }

        if exhausted {
            let wanted = until_reset + Duration::from_secs(1);
            let wait = wanted.min(max_wait);
            if wait < wanted {
                warn!(
                    "Capping rate limit wait from {:.1}s to {:.1}s",
                    wanted.as_secs_f64(),
                    wait.as_secs_f64()
                );
            }
            warn!("Rate limit exhausted, waiting {:.1}s", wait.as_secs_f64());
            return self.pause(wait, shutdown).await;
        }

        if remaining <= self.config.low_quota_threshold {
            let wait = self.config.low_quota_pause.min(max_wait);
            warn!(
                "Rate limit low ({} remaining), waiting {:.1}s",
                remaining,
                wait.as_secs_f64()
            );
            return self.pause(wait, shutdown).await;
        }

        false
    }

    fn classify(status: u16) -> Verdict {
        match status {
            429 => Verdict::Retry(AttemptFailure::QuotaRejected { status }),
            401 => Verdict::Unauthorized,
            500..=599 => Verdict::Retry(AttemptFailure::ServerError { status }),
            _ => Verdict::Success,
        }
    }

    /// Run one item. Returns true if shutdown interrupted it.
    async fn process(&self, item: RequestItem, shutdown: &mut watch::Receiver<bool>) -> bool {
        if self.throttle(shutdown).await {
            item.resolve(Err(DispatchError::Closed));
            return true;
        }

        lock(&self.core).in_flight = true;
        let started = Instant::now();
        let outcome = (item.operation)().await;
        let elapsed = started.elapsed();
        lock(&self.core).in_flight = false;

        match outcome {
            Ok(response) => {
                let snapshot =
                    self.apply_response(&response.headers, response.status, item.target.as_deref());
                self.persist(&snapshot).await;
                self.log_request(
                    item.target.as_deref(),
                    Some(response.status),
                    elapsed,
                    response.status == 429,
                )
                .await;

                match Self::classify(response.status) {
                    Verdict::Success => {
                        debug!(
                            "Request completed in {:.2}s (status {})",
                            elapsed.as_secs_f64(),
                            response.status
                        );
                        item.resolve(Ok(response));
                    }
                    Verdict::Unauthorized => {
                        warn!("Authentication rejected (status {})", response.status);
                        item.resolve(Err(DispatchError::Unauthorized { response }));
                    }
                    Verdict::Retry(failure) => self.retry_or_reject(item, failure),
                }
            }
            Err(err) => {
                if self.config.transport_failures_trip_breaker {
                    let snapshot = {
                        let mut core = lock(&self.core);
                        core.breaker.record_failure(Utc::now());
                        core.snapshot()
                    };
                    self.persist(&snapshot).await;
                }
                self.log_request(item.target.as_deref(), None, elapsed, false)
                    .await;

                if err.is_retryable() {
                    self.retry_or_reject(item, AttemptFailure::Transport(err));
                } else {
                    error!("Request failed: {}", err);
                    item.resolve(Err(DispatchError::Transport(err)));
                }
            }
        }

        false
    }

    /// Apply headers and breaker bookkeeping, capture validators on a 200,
    /// and return the snapshot to persist.
    fn apply_response(
        &self,
        headers: &HashMap<String, String>,
        status: u16,
        target: Option<&str>,
    ) -> PersistedSnapshot {
        let now = Utc::now();
        let mut core = lock(&self.core);
        core.state.apply_headers(headers, &self.config.headers, now);

        let counts_as_failure =
            status == 429 || (self.config.server_errors_trip_breaker && status >= 500);
        if counts_as_failure {
            core.breaker.record_failure(now);
        } else {
            core.breaker.record_success();
        }

        if status == 200 {
            if let Some(target) = target {
                core.cache.capture(target, headers, &self.config.headers);
            }
        }

        core.snapshot()
    }

    fn retry_or_reject(&self, mut item: RequestItem, failure: AttemptFailure) {
        if item.retries < item.max_retries {
            item.retries += 1;
            let retry_after = lock(&self.core).state.retry_after;
            let delay = self.backoff.calculate(item.retries, retry_after);
            warn!(
                "Retrying {} request in {:.1}s (attempt {}/{}): {}",
                item.priority,
                delay.as_secs_f64(),
                item.retries + 1,
                item.max_retries + 1,
                failure
            );

            let rejected = lock(&self.queue)
                .push_delayed(item, Instant::now() + delay)
                .err();
            match rejected {
                Some(item) => item.resolve(Err(DispatchError::Closed)),
                None => self.wakeup.notify_one(),
            }
        } else {
            let attempts = item.retries + 1;
            error!("Request failed after {} attempts: {}", attempts, failure);
            item.resolve(Err(DispatchError::RetriesExhausted {
                attempts,
                last: failure,
            }));
        }
    }

    async fn persist(&self, snapshot: &PersistedSnapshot) {
        if let Err(e) = self.store.save(&self.config.scope, snapshot).await {
            warn!("Failed to save rate limit state: {}", e);
        }
    }

    async fn log_request(
        &self,
        target: Option<&str>,
        status_code: Option<u16>,
        elapsed: Duration,
        rate_limited: bool,
    ) {
        let entry = RequestLogEntry {
            timestamp: Utc::now(),
            target: target.map(str::to_string),
            status_code,
            elapsed_ms: elapsed.as_millis().min(u128::from(u64::MAX)) as u64,
            rate_limited,
        };
        if let Err(e) = self.store.record_request(&self.config.scope, &entry).await {
            debug!("Failed to record request: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::operation;
    use std::sync::atomic::AtomicUsize;

    fn ok_op() -> Operation {
        operation(|| async { Ok(TransportResponse::new(200)) })
    }

    /// Returns each status in turn, repeating the last one.
    fn scripted(statuses: Vec<u16>) -> (Operation, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let statuses = Arc::new(statuses);
        let op = operation(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let status = statuses[n.min(statuses.len() - 1)];
            async move { Ok(TransportResponse::new(status)) }
        });
        (op, calls)
    }

    #[tokio::test]
    async fn test_execute_success() {
        let dispatcher = Dispatcher::in_memory(DispatcherConfig::for_tests()).await;
        let response = dispatcher
            .execute(ok_op(), RequestPriority::Normal)
            .await
            .unwrap();
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let dispatcher = Dispatcher::in_memory(DispatcherConfig::for_tests()).await;
        let (op, calls) = scripted(vec![503, 503, 200]);
        let response = dispatcher.execute(op, RequestPriority::High).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let dispatcher = Dispatcher::in_memory(DispatcherConfig::for_tests()).await;
        let (op, calls) = scripted(vec![500]);
        let err = dispatcher
            .execute(op, RequestOptions::new(RequestPriority::Normal).max_retries(2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::RetriesExhausted {
                attempts: 3,
                last: AttemptFailure::ServerError { status: 500 }
            }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unauthorized_is_not_retried() {
        let dispatcher = Dispatcher::in_memory(DispatcherConfig::for_tests()).await;
        let (op, calls) = scripted(vec![401]);
        let err = dispatcher
            .execute(op, RequestPriority::Critical)
            .await
            .unwrap_err();
        assert!(err.is_unauthorized());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fatal_transport_error_is_not_retried() {
        let dispatcher = Dispatcher::in_memory(DispatcherConfig::for_tests()).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let op = operation(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(TransportError::Fatal("bad url".into())) }
        });
        let err = dispatcher.execute(op, RequestPriority::Low).await.unwrap_err();
        assert!(matches!(err, DispatchError::Transport(TransportError::Fatal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_network_error_is_retried() {
        let dispatcher = Dispatcher::in_memory(DispatcherConfig::for_tests()).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let op = operation(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(TransportError::Network("connection reset".into()))
                } else {
                    Ok(TransportResponse::new(204))
                }
            }
        });
        let response = dispatcher.execute(op, RequestPriority::Normal).await.unwrap();
        assert_eq!(response.status, 204);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_captures_validators_for_target() {
        let dispatcher = Dispatcher::in_memory(DispatcherConfig::for_tests()).await;
        let op = operation(|| async {
            Ok(TransportResponse::new(200)
                .with_header("ETag", "\"v7\"")
                .with_header("Last-Modified", "Wed, 21 Oct 2015 07:28:00 GMT"))
        });
        dispatcher
            .execute(op, RequestOptions::new(RequestPriority::Normal).target("/c/2"))
            .await
            .unwrap();

        let headers = dispatcher.conditional_headers("/c/2");
        assert_eq!(headers.get("If-None-Match").map(String::as_str), Some("\"v7\""));
        assert!(headers.contains_key("If-Modified-Since"));
        assert!(dispatcher.conditional_headers("/c/3").is_empty());
        assert_eq!(dispatcher.metrics().cache_entries, 1);
    }

    #[tokio::test]
    async fn test_update_from_response_tracks_quota() {
        let dispatcher = Dispatcher::in_memory(DispatcherConfig::for_tests()).await;
        let mut headers = HashMap::new();
        headers.insert("x-ratelimit-remaining".to_string(), "37".to_string());
        dispatcher.update_from_response(&headers, 200).await;

        let metrics = dispatcher.metrics();
        assert_eq!(metrics.remaining(), 37);
        assert!(!metrics.breaker_open());
        assert_eq!(metrics.queue_size, 0);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_requests() {
        let dispatcher = Dispatcher::in_memory(DispatcherConfig::for_tests()).await;
        dispatcher.shutdown().await;
        assert!(dispatcher.is_closed());
        let err = dispatcher
            .execute(ok_op(), RequestPriority::Normal)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Closed));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_queued_requests() {
        let dispatcher = Dispatcher::in_memory(DispatcherConfig::for_tests()).await;
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));
        let blocker = operation(move || {
            let release_rx = release_rx.clone();
            async move {
                if let Some(rx) = release_rx.lock().await.take() {
                    let _ = rx.await;
                }
                Ok(TransportResponse::new(200))
            }
        });

        let first = dispatcher.submit(blocker, RequestPriority::Normal);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let queued = dispatcher.submit(ok_op(), RequestPriority::Normal);

        let stopper = dispatcher.clone();
        let stop = tokio::spawn(async move { stopper.shutdown().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = release_tx.send(());

        assert_eq!(first.await.unwrap().status, 200);
        assert!(matches!(queued.await, Err(DispatchError::Closed)));
        stop.await.unwrap();
    }
}
