//! Purchase tasks and their outcomes.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Errors parsing a `"<collection>/<item>"` target.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetParseError {
    #[error("expected <collection>/<item>, got '{0}'")]
    Format(String),
    #[error("invalid {field} id '{value}'")]
    InvalidId { field: &'static str, value: String },
}

/// The item a purchase attempt is aimed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PurchaseTarget {
    pub collection_id: u64,
    pub item_id: u64,
}

impl PurchaseTarget {
    pub fn new(collection_id: u64, item_id: u64) -> Self {
        Self {
            collection_id,
            item_id,
        }
    }
}

impl fmt::Display for PurchaseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection_id, self.item_id)
    }
}

impl FromStr for PurchaseTarget {
    type Err = TargetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (collection, item) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| TargetParseError::Format(s.to_string()))?;

        let parse = |field: &'static str, value: &str| {
            value
                .trim()
                .parse::<u64>()
                .map_err(|_| TargetParseError::InvalidId {
                    field,
                    value: value.to_string(),
                })
        };

        Ok(Self {
            collection_id: parse("collection", collection)?,
            item_id: parse("item", item)?,
        })
    }
}

/// One queued purchase attempt.
#[derive(Debug, Clone)]
pub struct PurchaseTask {
    pub task_id: Uuid,
    pub target: PurchaseTarget,
    /// Lower runs first.
    pub priority: u32,
    pub created_at: DateTime<Utc>,
}

impl PurchaseTask {
    pub fn new(target: PurchaseTarget, priority: u32) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            target,
            priority,
            created_at: Utc::now(),
        }
    }
}

/// Outcome of one task, reported through the pool callback.
#[derive(Debug, Clone)]
pub struct WorkerResult {
    pub worker_id: usize,
    pub task: PurchaseTask,
    pub success: bool,
    /// Units acquired. Zero on failure.
    pub units: u32,
    pub error: Option<String>,
    /// Label of the egress identity the worker used.
    pub identity: String,
    pub elapsed: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target() {
        let target: PurchaseTarget = "2/19".parse().unwrap();
        assert_eq!(target, PurchaseTarget::new(2, 19));
        assert_eq!(target.to_string(), "2/19");
        assert_eq!(" 7 / 3 ".parse::<PurchaseTarget>().unwrap(), PurchaseTarget::new(7, 3));
    }

    #[test]
    fn test_parse_target_errors() {
        assert_eq!(
            "219".parse::<PurchaseTarget>(),
            Err(TargetParseError::Format("219".to_string()))
        );
        assert!(matches!(
            "x/19".parse::<PurchaseTarget>(),
            Err(TargetParseError::InvalidId {
                field: "collection",
                ..
            })
        ));
        assert!(matches!(
            "2/-1".parse::<PurchaseTarget>(),
            Err(TargetParseError::InvalidId { field: "item", .. })
        ));
    }

    #[test]
    fn test_tasks_get_distinct_ids() {
        let target = PurchaseTarget::new(1, 1);
        assert_ne!(
            PurchaseTask::new(target, 0).task_id,
            PurchaseTask::new(target, 0).task_id
        );
    }
}
