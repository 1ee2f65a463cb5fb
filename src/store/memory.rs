//! In-process claim store.
//!
//! Same contracts as the Postgres store over a mutex-guarded ordered map.
//! Row locks are tokens stamped on rows by an open [`RowLock`]; claims skip
//! locked rows the way `SKIP LOCKED` does.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{ClaimStore, LockingStore, RowLock};
use crate::error::{Error, Result};
use crate::model::{NewWorkItem, Status, StatusCounts, WorkId, WorkItem, validate_transition};

#[derive(Debug)]
struct Row {
    item: WorkItem,
    lock: Option<u64>,
}

impl Row {
    fn is_available(&self) -> bool {
        self.item.status == Status::Pending && self.lock.is_none()
    }

    fn set_status(&mut self, to: Status, now: DateTime<Utc>) -> Result<()> {
        validate_transition(self.item.status, to)?;
        self.item.status = to;
        self.item.updated_at = now;
        if to != Status::Claimed {
            self.item.claimed_at = None;
            self.item.owner = None;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    /// Keyed by id, which is time-ordered, so iteration is oldest first.
    rows: BTreeMap<WorkId, Row>,
    next_lock: u64,
}

/// Shared in-memory store. Cloning yields another handle to the same rows.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a new pending item.
    pub fn enqueue(&self, new: NewWorkItem) -> WorkItem {
        let item = WorkItem::from_new(new, Utc::now());
        self.state().rows.insert(
            item.id,
            Row {
                item: item.clone(),
                lock: None,
            },
        );
        item
    }

    /// Insert many pending items, preserving their order.
    pub fn enqueue_many(&self, items: impl IntoIterator<Item = NewWorkItem>) -> Vec<WorkItem> {
        items.into_iter().map(|new| self.enqueue(new)).collect()
    }

    /// Get a work item by ID.
    pub fn get(&self, id: WorkId) -> Result<WorkItem> {
        self.state()
            .rows
            .get(&id)
            .map(|row| row.item.clone())
            .ok_or_else(|| Error::NotFound(format!("work item {id}")))
    }

    /// List items in a status, oldest first.
    pub fn list_by_status(&self, status: Status) -> Vec<WorkItem> {
        self.state()
            .rows
            .values()
            .filter(|row| row.item.status == status)
            .map(|row| row.item.clone())
            .collect()
    }

    pub fn count_by_status(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for row in self.state().rows.values() {
            match row.item.status {
                Status::Pending => counts.pending += 1,
                Status::Claimed => counts.claimed += 1,
                Status::Done => counts.done += 1,
            }
        }
        counts
    }

    fn unlock(&self, token: u64) {
        for row in self.state().rows.values_mut() {
            if row.lock == Some(token) {
                row.lock = None;
            }
        }
    }
}

#[async_trait]
impl ClaimStore for MemoryStore {
    async fn try_claim_batch(&self, max_items: usize, owner: &str) -> Result<Vec<WorkItem>> {
        let now = Utc::now();
        let mut state = self.state();
        let mut claimed = Vec::new();
        for row in state.rows.values_mut() {
            if claimed.len() >= max_items {
                break;
            }
            if !row.is_available() {
                continue;
            }
            row.set_status(Status::Claimed, now)?;
            row.item.claimed_at = Some(now);
            row.item.owner = Some(owner.to_string());
            row.item.attempts += 1;
            claimed.push(row.item.clone());
        }
        Ok(claimed)
    }

    async fn mark_done(&self, ids: &[WorkId]) -> Result<u64> {
        let now = Utc::now();
        let mut state = self.state();
        let mut changed = 0;
        for id in ids {
            // Rows under an open row lock belong to that transaction.
            if let Some(row) = state.rows.get_mut(id)
                && row.item.status != Status::Done
                && row.lock.is_none()
            {
                row.set_status(Status::Done, now)?;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn release(&self, ids: &[WorkId], owner: &str) -> Result<u64> {
        let now = Utc::now();
        let mut state = self.state();
        let mut changed = 0;
        for id in ids {
            if let Some(row) = state.rows.get_mut(id)
                && row.item.status == Status::Claimed
                && row.item.owner.as_deref() == Some(owner)
            {
                row.set_status(Status::Pending, now)?;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn release_stale(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let now = Utc::now();
        let mut state = self.state();
        let mut changed = 0;
        for row in state.rows.values_mut() {
            let stale = row.item.status == Status::Claimed
                && row.item.claimed_at.is_some_and(|at| at < older_than);
            if stale {
                row.set_status(Status::Pending, now)?;
                changed += 1;
            }
        }
        Ok(changed)
    }
}

#[async_trait]
impl LockingStore for MemoryStore {
    async fn lock_batch(&self, max_items: usize) -> Result<Box<dyn RowLock>> {
        let mut state = self.state();
        state.next_lock += 1;
        let token = state.next_lock;
        let mut items = Vec::new();
        for row in state.rows.values_mut() {
            if items.len() >= max_items {
                break;
            }
            if row.is_available() {
                row.lock = Some(token);
                items.push(row.item.clone());
            }
        }
        drop(state);
        Ok(Box::new(MemoryRowLock {
            store: self.clone(),
            token,
            items,
        }))
    }

    async fn count_available(&self) -> Result<u64> {
        Ok(self
            .state()
            .rows
            .values()
            .filter(|row| row.is_available())
            .count() as u64)
    }
}

/// Locks held by one simulated transaction. Dropping releases them.
struct MemoryRowLock {
    store: MemoryStore,
    token: u64,
    items: Vec<WorkItem>,
}

#[async_trait]
impl RowLock for MemoryRowLock {
    fn items(&self) -> &[WorkItem] {
        &self.items
    }

    async fn commit(self: Box<Self>, done: &[WorkId]) -> Result<()> {
        let done: HashSet<&WorkId> = done.iter().collect();
        let now = Utc::now();
        let mut state = self.store.state();
        let mut targets: Vec<&mut Row> = state
            .rows
            .values_mut()
            .filter(|row| {
                row.lock == Some(self.token)
                    && row.item.status != Status::Done
                    && done.contains(&row.item.id)
            })
            .collect();
        // All or nothing, like the transaction it stands in for.
        for row in &targets {
            validate_transition(row.item.status, Status::Done)?;
        }
        for row in &mut targets {
            row.set_status(Status::Done, now)?;
        }
        drop(targets);
        drop(state);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

impl Drop for MemoryRowLock {
    fn drop(&mut self) {
        self.store.unlock(self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(n: usize) -> MemoryStore {
        let store = MemoryStore::new();
        store.enqueue_many((0..n).map(|i| NewWorkItem::new(format!("item-{i}"))));
        store
    }

    #[tokio::test]
    async fn claim_takes_oldest_first() {
        let store = store_with(5);
        let claimed = store.try_claim_batch(2, "w1").await.unwrap();
        let names: Vec<_> = claimed.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["item-0", "item-1"]);
        assert!(claimed.iter().all(|i| i.status == Status::Claimed));
        assert!(claimed.iter().all(|i| i.claimed_at.is_some()));
        assert!(claimed.iter().all(|i| i.attempts == 1));
    }

    #[tokio::test]
    async fn mark_done_is_a_noop_for_done_items() {
        let store = store_with(1);
        let claimed = store.try_claim_batch(1, "w1").await.unwrap();
        let ids: Vec<_> = claimed.iter().map(|i| i.id).collect();
        assert_eq!(store.mark_done(&ids).await.unwrap(), 1);
        assert_eq!(store.mark_done(&ids).await.unwrap(), 0);
        let item = store.get(ids[0]).unwrap();
        assert_eq!(item.status, Status::Done);
        assert!(item.claimed_at.is_none());
    }

    #[tokio::test]
    async fn release_requires_matching_owner() {
        let store = store_with(1);
        let claimed = store.try_claim_batch(1, "w1").await.unwrap();
        let ids: Vec<_> = claimed.iter().map(|i| i.id).collect();
        assert_eq!(store.release(&ids, "w2").await.unwrap(), 0);
        assert_eq!(store.release(&ids, "w1").await.unwrap(), 1);
        assert_eq!(store.release(&ids, "w1").await.unwrap(), 0);
        assert_eq!(store.count_by_status().pending, 1);
    }

    #[tokio::test]
    async fn locked_rows_are_skipped_by_claims() {
        let store = store_with(3);
        let lock = store.lock_batch(2).await.unwrap();
        let claimed = store.try_claim_batch(10, "w1").await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].name, "item-2");
        drop(lock);
        assert_eq!(store.count_available().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn mark_done_skips_rows_under_an_open_lock() {
        let store = store_with(3);
        let lock = store.lock_batch(3).await.unwrap();
        let ids: Vec<_> = lock.items().iter().map(|i| i.id).collect();

        assert_eq!(store.mark_done(&ids[2..]).await.unwrap(), 0);
        assert_eq!(store.count_by_status().done, 0);

        lock.commit(&ids).await.unwrap();
        let counts = store.count_by_status();
        assert_eq!(counts.done, 3);
        assert_eq!(counts.pending, 0);
    }

    #[tokio::test]
    async fn commit_leaves_rows_finished_elsewhere_alone() {
        let store = store_with(2);
        let lock = store.lock_batch(2).await.unwrap();
        let ids: Vec<_> = lock.items().iter().map(|i| i.id).collect();

        // Finished by a path that bypasses the lock.
        {
            let mut state = store.state();
            let row = state.rows.get_mut(&ids[1]).unwrap();
            row.set_status(Status::Done, Utc::now()).unwrap();
        }

        lock.commit(&ids).await.unwrap();
        assert_eq!(store.count_by_status().done, 2);
        assert_eq!(store.get(ids[0]).unwrap().status, Status::Done);
    }

    #[tokio::test]
    async fn commit_marks_only_listed_rows_done() {
        let store = store_with(3);
        let lock = store.lock_batch(3).await.unwrap();
        let first = lock.items()[0].id;
        lock.commit(&[first]).await.unwrap();
        let counts = store.count_by_status();
        assert_eq!(counts.done, 1);
        assert_eq!(counts.pending, 2);
        assert_eq!(store.count_available().await.unwrap(), 2);
    }
}
