//! Priority queue of pending requests.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::error::DispatchError;
use crate::transport::{Operation, TransportResponse};

/// Dispatch precedence. Lower value goes first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RequestPriority {
    /// Purchase settlement calls.
    Critical = 1,
    /// Live price checks.
    High = 2,
    /// Collection and status polling.
    #[default]
    Normal = 3,
    /// Background monitoring.
    Low = 4,
}

impl RequestPriority {
    pub fn value(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for RequestPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestPriority::Critical => write!(f, "critical"),
            RequestPriority::High => write!(f, "high"),
            RequestPriority::Normal => write!(f, "normal"),
            RequestPriority::Low => write!(f, "low"),
        }
    }
}

/// Per-request options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    pub priority: RequestPriority,
    /// Overrides the dispatcher's default retry budget.
    pub max_retries: Option<u32>,
    /// Cache key for entity validators (usually the request URL).
    pub target: Option<String>,
}

impl RequestOptions {
    pub fn new(priority: RequestPriority) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

impl From<RequestPriority> for RequestOptions {
    fn from(priority: RequestPriority) -> Self {
        Self::new(priority)
    }
}

pub(crate) type Responder = oneshot::Sender<Result<TransportResponse, DispatchError>>;

/// One pending unit of work.
pub(crate) struct RequestItem {
    pub priority: RequestPriority,
    pub operation: Operation,
    pub responder: Responder,
    /// Set once at submission; retries keep it.
    pub created_at: Instant,
    pub seq: u64,
    pub retries: u32,
    pub max_retries: u32,
    pub target: Option<String>,
}

impl RequestItem {
    fn key(&self) -> (RequestPriority, Instant, u64) {
        (self.priority, self.created_at, self.seq)
    }

    /// Hand the outcome to the caller. A caller that stopped waiting is ignored.
    pub fn resolve(self, outcome: Result<TransportResponse, DispatchError>) {
        let _ = self.responder.send(outcome);
    }
}

impl PartialEq for RequestItem {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for RequestItem {}

impl PartialOrd for RequestItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RequestItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// What the dispatch loop should do next.
pub(crate) enum Next {
    Ready(RequestItem),
    /// Only backing-off items are queued; the earliest is due at this instant.
    WaitUntil(Instant),
    Idle,
}

/// Ready items ordered by (priority, creation time), plus items waiting
/// out a retry backoff.
#[derive(Default)]
pub(crate) struct RequestQueue {
    ready: BinaryHeap<Reverse<RequestItem>>,
    delayed: Vec<(Instant, RequestItem)>,
    closed: bool,
}

impl RequestQueue {
    /// Queue an item. Hands it back if the queue is closed.
    pub fn push(&mut self, item: RequestItem) -> Result<(), RequestItem> {
        if self.closed {
            return Err(item);
        }
        self.ready.push(Reverse(item));
        Ok(())
    }

    /// Queue an item that becomes ready at `ready_at`.
    pub fn push_delayed(&mut self, item: RequestItem, ready_at: Instant) -> Result<(), RequestItem> {
        if self.closed {
            return Err(item);
        }
        self.delayed.push((ready_at, item));
        Ok(())
    }

    pub fn pop(&mut self, now: Instant) -> Next {
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                let (_, item) = self.delayed.swap_remove(i);
                self.ready.push(Reverse(item));
            } else {
                i += 1;
            }
        }

        if let Some(Reverse(item)) = self.ready.pop() {
            return Next::Ready(item);
        }
        match self.delayed.iter().map(|(at, _)| *at).min() {
            Some(at) => Next::WaitUntil(at),
            None => Next::Idle,
        }
    }

    pub fn len(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }

    /// Refuse further items and return everything still queued.
    pub fn close(&mut self) -> Vec<RequestItem> {
        self.closed = true;
        let mut items: Vec<_> = self.ready.drain().map(|Reverse(item)| item).collect();
        items.extend(self.delayed.drain(..).map(|(_, item)| item));
        items
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::operation;
    use std::time::Duration;

    fn item(priority: RequestPriority, created_at: Instant, seq: u64) -> RequestItem {
        let (tx, _rx) = oneshot::channel();
        RequestItem {
            priority,
            operation: operation(|| async { Ok(TransportResponse::new(200)) }),
            responder: tx,
            created_at,
            seq,
            retries: 0,
            max_retries: 3,
            target: None,
        }
    }

    fn pop_seq(queue: &mut RequestQueue, now: Instant) -> Option<u64> {
        match queue.pop(now) {
            Next::Ready(item) => Some(item.seq),
            _ => None,
        }
    }

    #[test]
    fn test_priority_then_fifo() {
        let now = Instant::now();
        let mut queue = RequestQueue::default();
        assert!(queue.push(item(RequestPriority::Low, now, 0)).is_ok());
        assert!(queue.push(item(RequestPriority::Normal, now, 1)).is_ok());
        assert!(queue.push(item(RequestPriority::Critical, now, 2)).is_ok());
        assert!(queue.push(item(RequestPriority::Normal, now, 3)).is_ok());

        let order: Vec<_> = std::iter::from_fn(|| pop_seq(&mut queue, now)).collect();
        assert_eq!(order, vec![2, 1, 3, 0]);
    }

    #[test]
    fn test_retry_keeps_original_position() {
        let start = Instant::now();
        let later = start + Duration::from_millis(5);
        let mut queue = RequestQueue::default();

        // Retried item was created first; a newer item of the same tier is waiting.
        assert!(queue
            .push_delayed(item(RequestPriority::Normal, start, 0), later)
            .is_ok());
        assert!(queue.push(item(RequestPriority::Normal, later, 1)).is_ok());

        assert_eq!(pop_seq(&mut queue, later), Some(0));
        assert_eq!(pop_seq(&mut queue, later), Some(1));
    }

    #[test]
    fn test_wait_until_earliest_delayed() {
        let now = Instant::now();
        let due = now + Duration::from_secs(2);
        let mut queue = RequestQueue::default();
        assert!(queue
            .push_delayed(item(RequestPriority::High, now, 0), due + Duration::from_secs(1))
            .is_ok());
        assert!(queue.push_delayed(item(RequestPriority::Low, now, 1), due).is_ok());

        match queue.pop(now) {
            Next::WaitUntil(at) => assert_eq!(at, due),
            _ => panic!("expected WaitUntil"),
        }
        assert!(matches!(RequestQueue::default().pop(now), Next::Idle));
    }

    #[test]
    fn test_close_returns_everything() {
        let now = Instant::now();
        let mut queue = RequestQueue::default();
        assert!(queue.push(item(RequestPriority::Low, now, 0)).is_ok());
        assert!(queue
            .push_delayed(item(RequestPriority::Low, now, 1), now + Duration::from_secs(9))
            .is_ok());
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.close().len(), 2);
        assert!(queue.is_closed());
        assert!(queue.push(item(RequestPriority::Low, now, 2)).is_err());
    }
}
