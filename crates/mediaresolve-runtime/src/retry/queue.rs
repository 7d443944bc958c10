//! Retry queue operations over a [`RetryStore`].

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;

use mediaresolve_core::NextAction;

use super::{QueueOutcome, RetryError, RetryEvent, RetryItem, RetryStatus, RetryStore};
use crate::config::RetryConfig;
use crate::resilience::BackoffPolicy;
use crate::sources::SourceError;

/// How a failed execution was settled.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Settled {
    Rescheduled(RetryItem),
    Exhausted(RetryItem),
}

/// Queue of tasks awaiting background re-execution.
pub struct RetryQueue {
    store: Arc<dyn RetryStore>,
    policy: BackoffPolicy,
    max_attempts: u32,
    claim_lease: std::time::Duration,
    events: broadcast::Sender<RetryEvent>,
}

impl std::fmt::Debug for RetryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryQueue")
            .field("policy", &self.policy)
            .field("max_attempts", &self.max_attempts)
            .field("claim_lease", &self.claim_lease)
            .finish()
    }
}

pub(crate) fn after(now: DateTime<Utc>, delay: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(now)
}

fn before(now: DateTime<Utc>, delay: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl RetryQueue {
    pub fn new(store: Arc<dyn RetryStore>, config: &RetryConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            store,
            policy: config.backoff.clone(),
            max_attempts: config.max_attempts.max(1),
            claim_lease: config.claim_lease,
            events,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Receive lifecycle events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RetryEvent> {
        self.events.subscribe()
    }

    /// Queue a task after a transient failure.
    ///
    /// Non-retryable errors are rejected. A task id that is already queued is
    /// left untouched and reported as [`QueueOutcome::AlreadyQueued`].
    pub async fn queue_retry(
        &self,
        task_id: impl Into<String>,
        task_type: impl Into<String>,
        payload: serde_json::Value,
        error: &SourceError,
    ) -> Result<QueueOutcome, RetryError> {
        let task_id = task_id.into();
        if !error.is_retryable() {
            return Err(RetryError::NotRetryable(error.to_string()));
        }

        let next_attempt_at = after(Utc::now(), self.policy.delay_for(0));
        let item = RetryItem::new(
            task_id.clone(),
            task_type,
            payload,
            self.max_attempts,
            Some(error.to_string()),
            next_attempt_at,
        );

        if let Some(existing) = self.store.insert_if_absent(item.clone()).await? {
            tracing::debug!(task_id = %task_id, "Retry already queued");
            return Ok(QueueOutcome::AlreadyQueued(existing));
        }

        tracing::info!(
            task_id = %task_id,
            task_type = %item.task_type,
            next_attempt_at = %item.next_attempt_at,
            error = %error,
            "Queued retry"
        );
        self.emit(RetryEvent::Queued {
            task_id,
            task_type: item.task_type.clone(),
            next_attempt_at: item.next_attempt_at,
        });
        Ok(QueueOutcome::Queued(item))
    }

    /// Make a pending item eligible on the next scheduler tick.
    pub async fn trigger_immediate(&self, task_id: &str) -> Result<RetryItem, RetryError> {
        let mut item = self.pending_item(task_id).await?;
        let now = Utc::now();
        item.next_attempt_at = now;
        item.updated_at = now;

        let item = self
            .store
            .compare_and_swap(item)
            .await?
            .ok_or_else(|| RetryError::Conflict(task_id.to_string()))?;
        tracing::info!(task_id = %task_id, "Retry triggered immediately");
        Ok(item)
    }

    /// Remove a pending item. Items that are executing cannot be cancelled
    /// until their claim goes stale.
    pub async fn cancel_retry(&self, task_id: &str) -> Result<RetryItem, RetryError> {
        let item = self.pending_item(task_id).await?;
        if !self.store.remove(task_id, item.version).await? {
            return Err(RetryError::Conflict(task_id.to_string()));
        }

        tracing::info!(task_id = %task_id, attempts = item.attempts, "Retry cancelled");
        self.emit(RetryEvent::Cancelled {
            task_id: task_id.to_string(),
        });
        Ok(item)
    }

    /// Every queued item, soonest first.
    pub async fn get_pending(&self) -> Result<Vec<RetryItem>, RetryError> {
        Ok(self.store.list().await?)
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<RetryItem>, RetryError> {
        Ok(self.store.get(task_id).await?)
    }

    pub async fn is_queued(&self, task_id: &str) -> Result<bool, RetryError> {
        Ok(self.store.get(task_id).await?.is_some())
    }

    /// Items eligible at `now`, including claims older than the lease.
    pub(crate) async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<RetryItem>, RetryError> {
        Ok(self.store.due(now, self.stale_before(now), limit).await?)
    }

    /// Mark an item in flight. Returns `None` when another writer got there
    /// first, or the item is held by a claim that has not gone stale.
    pub(crate) async fn claim(
        &self,
        mut item: RetryItem,
        now: DateTime<Utc>,
    ) -> Result<Option<RetryItem>, RetryError> {
        if item.is_in_flight() && !item.is_stale(self.stale_before(now)) {
            return Ok(None);
        }
        if item.is_in_flight() {
            tracing::warn!(task_id = %item.task_id, claimed_at = %item.updated_at, "Reclaiming stale retry item");
        }
        item.status = RetryStatus::InFlight;
        item.updated_at = now.max(Utc::now());
        Ok(self.store.compare_and_swap(item).await?)
    }

    /// Settle a successful execution: the item is deleted.
    pub(crate) async fn complete(&self, item: &RetryItem) -> Result<(), RetryError> {
        let attempts = item.attempts + 1;
        if !self.store.remove(&item.task_id, item.version).await? {
            return Err(RetryError::Conflict(item.task_id.clone()));
        }

        tracing::info!(task_id = %item.task_id, attempts, "Retry succeeded");
        self.emit(RetryEvent::Succeeded {
            task_id: item.task_id.clone(),
            task_type: item.task_type.clone(),
            attempts,
        });
        Ok(())
    }

    /// Settle a failed execution.
    ///
    /// The attempt count always advances. Reaching the maximum deletes the
    /// item and emits `Exhausted`; otherwise it is rescheduled with backoff
    /// from `now`.
    pub(crate) async fn fail(
        &self,
        item: &RetryItem,
        error: String,
        now: DateTime<Utc>,
    ) -> Result<Settled, RetryError> {
        let mut next = item.clone();
        next.attempts += 1;
        next.last_error = Some(error.clone());
        next.updated_at = now;

        if next.attempts >= next.max_attempts {
            if !self.store.remove(&item.task_id, item.version).await? {
                return Err(RetryError::Conflict(item.task_id.clone()));
            }
            next.status = RetryStatus::Pending;
            tracing::warn!(
                task_id = %next.task_id,
                attempts = next.attempts,
                error = %error,
                "Retry exhausted"
            );
            self.emit(RetryEvent::Exhausted {
                item: next.clone(),
                next_actions: NextAction::for_exhausted_retries(),
            });
            return Ok(Settled::Exhausted(next));
        }

        next.status = RetryStatus::Pending;
        next.next_attempt_at = after(now, self.policy.delay_for(next.attempts));
        let stored = self
            .store
            .compare_and_swap(next)
            .await?
            .ok_or_else(|| RetryError::Conflict(item.task_id.clone()))?;

        tracing::warn!(
            task_id = %stored.task_id,
            attempts = stored.attempts,
            next_attempt_at = %stored.next_attempt_at,
            error = %error,
            "Retry failed, rescheduled"
        );
        self.emit(RetryEvent::Rescheduled {
            task_id: stored.task_id.clone(),
            attempts: stored.attempts,
            next_attempt_at: stored.next_attempt_at,
            error,
        });
        Ok(Settled::Rescheduled(stored))
    }

    async fn pending_item(&self, task_id: &str) -> Result<RetryItem, RetryError> {
        let item = self
            .store
            .get(task_id)
            .await?
            .ok_or_else(|| RetryError::NotFound(task_id.to_string()))?;
        if item.is_in_flight() && !item.is_stale(self.stale_before(Utc::now())) {
            return Err(RetryError::InFlight(task_id.to_string()));
        }
        Ok(item)
    }

    fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        before(now, self.claim_lease)
    }

    fn emit(&self, event: RetryEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}
