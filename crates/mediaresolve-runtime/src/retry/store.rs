//! Persistence seam for retry items.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;

use super::RetryItem;

/// Errors from a retry store backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Storage for retry items keyed by task id.
///
/// Writes are conditional on the item's `version`, so two workers cannot both
/// claim or both finish the same item.
#[async_trait]
pub trait RetryStore: Send + Sync {
    /// Insert `item` unless its task id is already stored. Returns the
    /// existing item when there is one.
    async fn insert_if_absent(&self, item: RetryItem) -> Result<Option<RetryItem>, StoreError>;

    async fn get(&self, task_id: &str) -> Result<Option<RetryItem>, StoreError>;

    /// All items, soonest first.
    async fn list(&self) -> Result<Vec<RetryItem>, StoreError>;

    /// Items eligible at `now`, soonest first, at most `limit`. In-flight
    /// items whose claim predates `stale_before` count as eligible.
    async fn due(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RetryItem>, StoreError>;

    /// Replace the stored item if its version still equals `item.version`.
    /// On success the stored copy (with its bumped version) is returned.
    async fn compare_and_swap(&self, item: RetryItem) -> Result<Option<RetryItem>, StoreError>;

    /// Delete the item if its version still equals `expected_version`.
    async fn remove(&self, task_id: &str, expected_version: u64) -> Result<bool, StoreError>;

    async fn len(&self) -> Result<usize, StoreError>;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct InMemoryRetryStore {
    items: RwLock<HashMap<String, RetryItem>>,
}

impl InMemoryRetryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn soonest_first(items: &mut [RetryItem]) {
    items.sort_by(|a, b| {
        a.next_attempt_at
            .cmp(&b.next_attempt_at)
            .then(a.created_at.cmp(&b.created_at))
    });
}

#[async_trait]
impl RetryStore for InMemoryRetryStore {
    async fn insert_if_absent(&self, item: RetryItem) -> Result<Option<RetryItem>, StoreError> {
        let mut items = self.items.write();
        if let Some(existing) = items.get(&item.task_id) {
            return Ok(Some(existing.clone()));
        }
        items.insert(item.task_id.clone(), item);
        Ok(None)
    }

    async fn get(&self, task_id: &str) -> Result<Option<RetryItem>, StoreError> {
        Ok(self.items.read().get(task_id).cloned())
    }

    async fn list(&self) -> Result<Vec<RetryItem>, StoreError> {
        let mut items: Vec<RetryItem> = self.items.read().values().cloned().collect();
        soonest_first(&mut items);
        Ok(items)
    }

    async fn due(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RetryItem>, StoreError> {
        let mut items: Vec<RetryItem> = self
            .items
            .read()
            .values()
            .filter(|item| item.is_claimable(now, stale_before))
            .cloned()
            .collect();
        soonest_first(&mut items);
        items.truncate(limit);
        Ok(items)
    }

    async fn compare_and_swap(&self, mut item: RetryItem) -> Result<Option<RetryItem>, StoreError> {
        let mut items = self.items.write();
        match items.get_mut(&item.task_id) {
            Some(stored) if stored.version == item.version => {
                item.version += 1;
                *stored = item.clone();
                Ok(Some(item))
            }
            _ => Ok(None),
        }
    }

    async fn remove(&self, task_id: &str, expected_version: u64) -> Result<bool, StoreError> {
        let mut items = self.items.write();
        match items.get(task_id) {
            Some(stored) if stored.version == expected_version => {
                items.remove(task_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.items.read().len())
    }
}
