//! Background retry of transient source failures.
//!
//! A failed lookup whose error is transient becomes a [`RetryItem`]. The
//! [`RetryScheduler`] re-executes due items with exponential backoff until
//! one succeeds or the item runs out of attempts. Outcomes are broadcast as
//! [`RetryEvent`]s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use mediaresolve_core::NextAction;

mod queue;
mod scheduler;
mod store;

pub use queue::RetryQueue;
pub use scheduler::{RetryScheduler, SearchTask, SearchTaskExecutor, TaskError, TaskExecutor, TickReport};
pub use store::{InMemoryRetryStore, RetryStore, StoreError};

/// Task type of a queued source search.
pub const SEARCH_TASK: &str = "search";

/// Errors from the retry queue.
#[derive(Error, Debug)]
pub enum RetryError {
    #[error("Error is not retryable: {0}")]
    NotRetryable(String),

    #[error("No pending retry for task '{0}'")]
    NotFound(String),

    #[error("Retry for task '{0}' is executing")]
    InFlight(String),

    #[error("Retry for task '{0}' was modified concurrently")]
    Conflict(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Lifecycle of a queued item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    /// Waiting for its next-eligible time
    Pending,
    /// Claimed by the scheduler and executing
    InFlight,
}

/// A task waiting to be re-executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryItem {
    pub id: Uuid,

    /// Caller-chosen identity; duplicates are not queued twice
    pub task_id: String,

    /// Executor dispatch key, e.g. [`SEARCH_TASK`]
    pub task_type: String,

    /// Serialized task input
    pub payload: serde_json::Value,

    /// Scheduled executions so far
    pub attempts: u32,

    pub max_attempts: u32,

    #[serde(default)]
    pub last_error: Option<String>,

    /// Earliest time the scheduler may pick the item up
    pub next_attempt_at: DateTime<Utc>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub status: RetryStatus,

    /// Optimistic concurrency token, bumped on every store write
    pub version: u64,
}

impl RetryItem {
    /// Create a pending item eligible at `next_attempt_at`.
    pub fn new(
        task_id: impl Into<String>,
        task_type: impl Into<String>,
        payload: serde_json::Value,
        max_attempts: u32,
        last_error: Option<String>,
        next_attempt_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_id: task_id.into(),
            task_type: task_type.into(),
            payload,
            attempts: 0,
            max_attempts,
            last_error,
            next_attempt_at,
            created_at: now,
            updated_at: now,
            status: RetryStatus::Pending,
            version: 0,
        }
    }

    /// Pending and eligible at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == RetryStatus::Pending && self.next_attempt_at <= now
    }

    pub fn is_in_flight(&self) -> bool {
        self.status == RetryStatus::InFlight
    }

    /// In flight, claimed before `stale_before` and never settled.
    pub fn is_stale(&self, stale_before: DateTime<Utc>) -> bool {
        self.is_in_flight() && self.updated_at < stale_before
    }

    /// Due at `now`, or holding a claim that went stale.
    pub fn is_claimable(&self, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> bool {
        self.is_due(now) || self.is_stale(stale_before)
    }

    /// Executions left before the item is given up on.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }
}

/// Result of a `queue_retry` call.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueOutcome {
    /// A new item was stored
    Queued(RetryItem),
    /// An item with the same task id already exists and was left untouched
    AlreadyQueued(RetryItem),
}

impl QueueOutcome {
    pub fn item(&self) -> &RetryItem {
        match self {
            QueueOutcome::Queued(item) | QueueOutcome::AlreadyQueued(item) => item,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, QueueOutcome::Queued(_))
    }
}

/// Retry lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RetryEvent {
    Queued {
        task_id: String,
        task_type: String,
        next_attempt_at: DateTime<Utc>,
    },
    Succeeded {
        task_id: String,
        task_type: String,
        attempts: u32,
    },
    Rescheduled {
        task_id: String,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        error: String,
    },
    Exhausted {
        item: RetryItem,
        next_actions: Vec<NextAction>,
    },
    Cancelled {
        task_id: String,
    },
}

impl RetryEvent {
    pub fn task_id(&self) -> &str {
        match self {
            RetryEvent::Queued { task_id, .. }
            | RetryEvent::Succeeded { task_id, .. }
            | RetryEvent::Rescheduled { task_id, .. }
            | RetryEvent::Cancelled { task_id } => task_id,
            RetryEvent::Exhausted { item, .. } => &item.task_id,
        }
    }
}
