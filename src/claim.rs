//! Claim protocol.
//!
//! Two interchangeable strategies for owning a batch of work items:
//!
//! - [`ClaimStrategy::LeaseBased`]: claims are persisted in the status column
//!   and expire by time. A worker that dies leaves its items `claimed` until
//!   the stale-claim sweeper returns them to `pending`.
//! - [`ClaimStrategy::TransactionScoped`]: claims are row locks held by an
//!   open transaction. Ending the transaction, by commit, rollback, drop, or
//!   connection loss, ends the claim.
//!
//! Callers only see [`ClaimStrategy::claim`] and the [`ClaimedBatch`] it
//! returns.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use opentelemetry::KeyValue;
use tracing::{debug, warn};

use crate::error::Result;
use crate::model::{WorkId, WorkItem};
use crate::store::{ClaimStore, LockingStore, RowLock};
use crate::telemetry::metrics;

/// Which claim strategy a deployment runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Lease,
    Transaction,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::Lease => f.write_str("lease"),
            StrategyKind::Transaction => f.write_str("transaction"),
        }
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "lease" => Ok(StrategyKind::Lease),
            "transaction" => Ok(StrategyKind::Transaction),
            other => Err(crate::error::Error::Config(format!(
                "unknown claim strategy {other:?} (expected \"lease\" or \"transaction\")"
            ))),
        }
    }
}

/// How a worker acquires ownership of work items.
#[derive(Clone)]
pub enum ClaimStrategy {
    LeaseBased(Arc<dyn ClaimStore>),
    TransactionScoped(Arc<dyn LockingStore>),
}

impl ClaimStrategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            ClaimStrategy::LeaseBased(_) => StrategyKind::Lease,
            ClaimStrategy::TransactionScoped(_) => StrategyKind::Transaction,
        }
    }

    /// Claim up to `limit` pending items for `owner`.
    ///
    /// The batch may be empty. An empty transaction-scoped batch still holds
    /// an open transaction until it is finished or dropped.
    pub async fn claim(&self, limit: usize, owner: &str) -> Result<ClaimedBatch> {
        let (items, hold) = match self {
            ClaimStrategy::LeaseBased(store) => {
                let items = store.try_claim_batch(limit, owner).await?;
                (
                    items,
                    Hold::Lease {
                        store: Arc::clone(store),
                    },
                )
            }
            ClaimStrategy::TransactionScoped(store) => {
                let lock = store.lock_batch(limit).await?;
                (lock.items().to_vec(), Hold::Transaction(lock))
            }
        };

        if !items.is_empty() {
            metrics::claimed_items().add(
                items.len() as u64,
                &[KeyValue::new("strategy", self.kind().to_string())],
            );
        }

        Ok(ClaimedBatch {
            owner: owner.to_string(),
            items,
            hold,
        })
    }
}

impl fmt::Debug for ClaimStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ClaimStrategy").field(&self.kind()).finish()
    }
}

enum Hold {
    Lease { store: Arc<dyn ClaimStore> },
    Transaction(Box<dyn RowLock>),
}

/// A batch of items owned by one worker.
///
/// Finishing consumes the batch. Dropping it unfinished abandons the claim:
/// lease claims stay `claimed` until swept, transaction claims roll back.
pub struct ClaimedBatch {
    owner: String,
    items: Vec<WorkItem>,
    hold: Hold,
}

impl ClaimedBatch {
    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Mark every item done.
    pub async fn complete(self) -> Result<()> {
        let ids: Vec<WorkId> = self.items.iter().map(|i| i.id).collect();
        self.finish(&ids).await
    }

    /// Mark `done` items done and give the rest of the batch back.
    ///
    /// Ids outside the batch are ignored.
    pub async fn finish(self, done: &[WorkId]) -> Result<()> {
        let wanted: HashSet<WorkId> = done.iter().copied().collect();
        let (done, rest): (Vec<WorkId>, Vec<WorkId>) = self
            .items
            .iter()
            .map(|i| i.id)
            .partition(|id| wanted.contains(id));
        let strategy = self.kind().to_string();

        match self.hold {
            Hold::Lease { store } => {
                let marked = store.mark_done(&done).await?;
                if marked < done.len() as u64 {
                    debug!(
                        owner = %self.owner,
                        expected = done.len(),
                        marked,
                        "some items were already done"
                    );
                }
                let released = store.release(&rest, &self.owner).await?;
                if released < rest.len() as u64 {
                    warn!(
                        owner = %self.owner,
                        expected = rest.len(),
                        released,
                        "lost claims before release; swept or taken by another worker"
                    );
                }
                record_released(&strategy, released);
            }
            Hold::Transaction(lock) => {
                lock.commit(&done).await?;
                record_released(&strategy, rest.len() as u64);
            }
        }

        if !done.is_empty() {
            metrics::completed_items().add(
                done.len() as u64,
                &[KeyValue::new("strategy", strategy)],
            );
        }
        Ok(())
    }

    /// Give the whole batch back without completing anything.
    pub async fn release(self) -> Result<()> {
        let strategy = self.kind().to_string();
        match self.hold {
            Hold::Lease { store } => {
                let ids: Vec<WorkId> = self.items.iter().map(|i| i.id).collect();
                let released = store.release(&ids, &self.owner).await?;
                record_released(&strategy, released);
            }
            Hold::Transaction(lock) => {
                lock.rollback().await?;
                record_released(&strategy, self.items.len() as u64);
            }
        }
        Ok(())
    }

    fn kind(&self) -> StrategyKind {
        match self.hold {
            Hold::Lease { .. } => StrategyKind::Lease,
            Hold::Transaction(_) => StrategyKind::Transaction,
        }
    }
}

fn record_released(strategy: &str, count: u64) {
    if count > 0 {
        metrics::released_items().add(count, &[KeyValue::new("strategy", strategy.to_string())]);
    }
}

impl fmt::Debug for ClaimedBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimedBatch")
            .field("owner", &self.owner)
            .field("strategy", &self.kind())
            .field("items", &self.items.len())
            .finish()
    }
}
