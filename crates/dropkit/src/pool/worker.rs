//! Worker loop: poll the shared queue, run one purchase, report it.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::executor::{PurchaseExecutor, WorkerContext};
use super::queue::TaskQueue;
use super::task::{PurchaseTask, WorkerResult};
use crate::sync::stopped;

/// Called once per finished task. Keep it quick; it runs on the worker.
pub type ResultCallback = Arc<dyn Fn(WorkerResult) + Send + Sync>;

/// State every worker loop shares with the pool.
pub(crate) struct Shared {
    pub queue: Arc<TaskQueue>,
    pub executor: Arc<dyn PurchaseExecutor>,
    pub callback: Option<ResultCallback>,
    pub active: AtomicUsize,
    pub poll_interval: Duration,
}

pub(crate) async fn run(
    ctx: WorkerContext,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("Worker {} started ({})", ctx.worker_id, ctx.identity);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let task = tokio::select! {
            task = shared.queue.pop(shared.poll_interval) => task,
            _ = stopped(&mut shutdown) => break,
        };
        let Some(task) = task else {
            continue;
        };

        shared.active.fetch_add(1, Ordering::SeqCst);
        let result = attempt(&ctx, shared.executor.as_ref(), task).await;
        shared.active.fetch_sub(1, Ordering::SeqCst);

        if result.success {
            info!(
                "Worker {} acquired {} unit(s) of {} in {:.2}s",
                result.worker_id,
                result.units,
                result.task.target,
                result.elapsed.as_secs_f64()
            );
        } else {
            warn!(
                "Worker {} failed {}: {}",
                result.worker_id,
                result.task.target,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }

        if let Some(callback) = &shared.callback {
            let worker_id = result.worker_id;
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| callback(result))) {
                warn!(
                    "Worker {} result callback panicked: {}",
                    worker_id,
                    panic_message(&*panic)
                );
            }
        }
        shared.queue.complete();
    }

    ctx.dispatcher.shutdown().await;
    debug!("Worker {} stopped", ctx.worker_id);
}

/// Run one task, turning errors and panics into a failed result.
async fn attempt(
    ctx: &WorkerContext,
    executor: &dyn PurchaseExecutor,
    task: PurchaseTask,
) -> WorkerResult {
    let started = Instant::now();
    let outcome = AssertUnwindSafe(executor.purchase(ctx, task.target))
        .catch_unwind()
        .await;

    let (success, units, error) = match outcome {
        Ok(Ok(0)) => (false, 0, Some("no units acquired".to_string())),
        Ok(Ok(units)) => (true, units, None),
        Ok(Err(e)) => (false, 0, Some(e.to_string())),
        Err(panic) => (
            false,
            0,
            Some(format!("executor panicked: {}", panic_message(&*panic))),
        ),
    };

    WorkerResult {
        worker_id: ctx.worker_id,
        task,
        success,
        units,
        error,
        identity: ctx.identity.to_string(),
        elapsed: started.elapsed(),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatcherConfig;
    use crate::dispatcher::Dispatcher;
    use crate::egress::EgressIdentity;
    use crate::pool::executor::PurchaseError;
    use crate::pool::task::PurchaseTarget;
    use async_trait::async_trait;

    struct ByItem;

    #[async_trait]
    impl PurchaseExecutor for ByItem {
        async fn purchase(
            &self,
            _ctx: &WorkerContext,
            target: PurchaseTarget,
        ) -> Result<u32, PurchaseError> {
            match target.item_id {
                0 => Ok(0),
                1 => Err(PurchaseError::Other("sold out".into())),
                2 => panic!("boom"),
                n => Ok(n as u32),
            }
        }
    }

    async fn ctx() -> WorkerContext {
        WorkerContext {
            worker_id: 7,
            identity: EgressIdentity::Direct,
            dispatcher: Dispatcher::in_memory(DispatcherConfig::for_tests()).await,
        }
    }

    async fn run_item(item_id: u64) -> WorkerResult {
        let task = PurchaseTask::new(PurchaseTarget::new(1, item_id), 0);
        attempt(&ctx().await, &ByItem, task).await
    }

    #[tokio::test]
    async fn test_success_reports_units() {
        let result = run_item(5).await;
        assert!(result.success);
        assert_eq!(result.units, 5);
        assert_eq!(result.worker_id, 7);
        assert_eq!(result.identity, "direct");
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_zero_units_is_failure() {
        let result = run_item(0).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("no units acquired"));
    }

    #[tokio::test]
    async fn test_error_is_reported() {
        let result = run_item(1).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("sold out"));
    }

    #[tokio::test]
    async fn test_panic_is_reported() {
        let result = run_item(2).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("executor panicked: boom"));
    }
}
