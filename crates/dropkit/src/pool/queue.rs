//! Shared task queue consumed by pool workers.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use super::task::PurchaseTask;
use crate::sync::lock;

struct Queued {
    seq: u64,
    task: PurchaseTask,
}

impl Queued {
    fn key(&self) -> (u32, u64) {
        (self.task.priority, self.seq)
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.key().cmp(&other.key())
    }
}

/// Many-producer many-consumer queue ordered by (priority, enqueue order).
///
/// `outstanding` counts tasks that were pushed but not yet finished, so
/// callers can wait until everything enqueued has been processed.
#[derive(Default)]
pub(crate) struct TaskQueue {
    heap: Mutex<BinaryHeap<Reverse<Queued>>>,
    seq: AtomicU64,
    available: Notify,
    outstanding: AtomicUsize,
    drained: Notify,
}

impl TaskQueue {
    pub fn push(&self, task: PurchaseTask) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        lock(&self.heap).push(Reverse(Queued { seq, task }));
        self.available.notify_one();
    }

    pub fn try_pop(&self) -> Option<PurchaseTask> {
        lock(&self.heap).pop().map(|Reverse(queued)| queued.task)
    }

    /// Wait up to `timeout` for a task.
    pub async fn pop(&self, timeout: Duration) -> Option<PurchaseTask> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            if let Some(task) = self.try_pop() {
                return Some(task);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop();
            }
        }
    }

    /// Mark a popped task as finished.
    pub fn complete(&self) {
        self.release(1);
    }

    /// Remove every queued task without running it.
    pub fn drain(&self) -> Vec<PurchaseTask> {
        let tasks: Vec<_> = lock(&self.heap)
            .drain()
            .map(|Reverse(queued)| queued.task)
            .collect();
        self.release(tasks.len());
        tasks
    }

    fn release(&self, count: usize) {
        if count == 0 {
            return;
        }
        let before = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(count))
            })
            .unwrap_or_default();
        if before <= count {
            self.drained.notify_waiters();
        }
    }

    /// Queued tasks, not counting those being executed.
    pub fn len(&self) -> usize {
        lock(&self.heap).len()
    }

    /// Pushed tasks not yet completed, including those being executed.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Wait until every pushed task has completed. Returns false on timeout.
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.outstanding() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.outstanding() == 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::task::PurchaseTarget;
    use std::sync::Arc;

    fn task(priority: u32) -> PurchaseTask {
        PurchaseTask::new(PurchaseTarget::new(1, u64::from(priority)), priority)
    }

    #[test]
    fn test_priority_then_fifo() {
        let queue = TaskQueue::default();
        queue.push(task(3));
        queue.push(task(1));
        let later = task(3);
        let later_id = later.task_id;
        queue.push(later);
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.try_pop().unwrap().priority, 1);
        let next = queue.try_pop().unwrap();
        assert_eq!(next.priority, 3);
        assert_ne!(next.task_id, later_id);
        assert_eq!(queue.try_pop().unwrap().task_id, later_id);
        assert!(queue.try_pop().is_none());
    }

    #[tokio::test]
    async fn test_pop_times_out_when_empty() {
        let queue = TaskQueue::default();
        let started = std::time::Instant::now();
        assert!(queue.pop(Duration::from_millis(30)).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(TaskQueue::default());
        let consumer = queue.clone();
        let handle = tokio::spawn(async move { consumer.pop(Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(task(2));
        let popped = handle.await.unwrap();
        assert_eq!(popped.map(|t| t.priority), Some(2));
    }

    #[tokio::test]
    async fn test_wait_drained_tracks_completion() {
        let queue = Arc::new(TaskQueue::default());
        assert!(queue.wait_drained(Duration::from_millis(10)).await);

        queue.push(task(1));
        queue.push(task(2));
        assert_eq!(queue.outstanding(), 2);
        assert!(!queue.wait_drained(Duration::from_millis(20)).await);

        let worker = queue.clone();
        tokio::spawn(async move {
            while let Some(_task) = worker.pop(Duration::from_millis(50)).await {
                tokio::time::sleep(Duration::from_millis(5)).await;
                worker.complete();
            }
        });
        assert!(queue.wait_drained(Duration::from_secs(2)).await);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_drain_releases_outstanding() {
        let queue = TaskQueue::default();
        queue.push(task(1));
        queue.push(task(1));
        assert_eq!(queue.drain().len(), 2);
        assert_eq!(queue.outstanding(), 0);
    }
}
