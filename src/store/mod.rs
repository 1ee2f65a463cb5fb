//! Claim store contracts.
//!
//! The store is the only synchronization point between workers. Every
//! implementation must make claiming atomic: two concurrent claims never
//! return the same item, and a claim never waits on rows another worker is
//! claiming.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{WorkId, WorkItem};

pub use memory::MemoryStore;

/// Status-column primitives used by the lease strategy.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Atomically move up to `max_items` pending items to `claimed`, oldest
    /// first, recording `owner` and the claim time.
    async fn try_claim_batch(&self, max_items: usize, owner: &str) -> Result<Vec<WorkItem>>;

    /// Mark items `done`. Items already done are left alone.
    async fn mark_done(&self, ids: &[WorkId]) -> Result<u64>;

    /// Return items still claimed by `owner` to `pending`.
    async fn release(&self, ids: &[WorkId], owner: &str) -> Result<u64>;

    /// Return every claim taken before `older_than` to `pending`.
    async fn release_stale(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

/// Row-lock primitives used by the transaction-scoped strategy.
#[async_trait]
pub trait LockingStore: Send + Sync {
    /// Open a transaction and lock up to `max_items` pending rows, skipping
    /// rows locked by other transactions.
    async fn lock_batch(&self, max_items: usize) -> Result<Box<dyn RowLock>>;

    /// Pending rows not currently locked by any open transaction.
    ///
    /// Stores that answer this with `SKIP LOCKED` briefly lock every pending
    /// row, so concurrent claims may come back empty while it runs. Meant for
    /// diagnostics, not for worker loops.
    async fn count_available(&self) -> Result<u64>;
}

/// An open transaction holding row locks on a batch of pending items.
///
/// This is the only handle to the transaction. `commit` and `rollback`
/// consume it; dropping it without either rolls back.
#[async_trait]
pub trait RowLock: Send {
    fn items(&self) -> &[WorkItem];

    /// Mark `done` items inside the transaction, then commit. Locked rows not
    /// in `done` stay pending.
    async fn commit(self: Box<Self>, done: &[WorkId]) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
