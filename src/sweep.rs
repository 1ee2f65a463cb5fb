//! Stale claim recovery for the lease strategy.
//!
//! Lease claims survive their worker. If the worker dies, its items stay
//! `claimed` until this sweeper notices the claim is older than the stale
//! threshold and returns it to `pending`. Transaction-scoped claims don't need
//! this: the store ends their transaction when the connection goes away.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::SweepConfig;
use crate::error::{Error, Result};
use crate::schedule::{ScheduleEntry, ScheduledTask};
use crate::store::ClaimStore;
use crate::telemetry::metrics;

/// Returns claims older than `threshold` to `pending` each time it fires.
pub struct StaleClaimSweeper {
    store: Arc<dyn ClaimStore>,
    threshold: Duration,
}

impl StaleClaimSweeper {
    pub fn new(store: Arc<dyn ClaimStore>, threshold: Duration) -> Self {
        Self { store, threshold }
    }

    /// Registry key for this task in schedule files.
    pub fn key() -> &'static str {
        std::any::type_name::<Self>()
    }

    /// A schedule entry running this sweeper at `config.interval`.
    pub fn entry(store: Arc<dyn ClaimStore>, config: SweepConfig) -> ScheduleEntry {
        ScheduleEntry::new(
            Arc::new(Self::new(store, config.threshold)),
            config.interval,
        )
    }

    /// Release every stale claim once. Returns how many were released.
    pub async fn sweep(&self) -> Result<u64> {
        let threshold = chrono::Duration::from_std(self.threshold)
            .map_err(|e| Error::Config(format!("stale threshold out of range: {e}")))?;
        let cutoff = Utc::now() - threshold;
        let released = self.store.release_stale(cutoff).await?;
        if released > 0 {
            metrics::swept_items().add(released, &[]);
            info!(released, %cutoff, "released stale claims");
        } else {
            debug!(%cutoff, "no stale claims");
        }
        Ok(released)
    }
}

#[async_trait]
impl ScheduledTask for StaleClaimSweeper {
    fn name(&self) -> &str {
        "stale-claim-sweeper"
    }

    async fn fire(&self, _cancel: &CancellationToken) -> Result<()> {
        self.sweep().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewWorkItem, Status};
    use crate::store::MemoryStore;

    #[test]
    fn key_is_the_qualified_type_name() {
        assert_eq!(StaleClaimSweeper::key(), "workq::sweep::StaleClaimSweeper");
    }

    #[tokio::test]
    async fn fresh_claims_are_left_alone() {
        let store = MemoryStore::new();
        store.enqueue(NewWorkItem::new("a"));
        store.try_claim_batch(1, "w1").await.unwrap();

        let sweeper = StaleClaimSweeper::new(Arc::new(store.clone()), Duration::from_secs(60));
        assert_eq!(sweeper.sweep().await.unwrap(), 0);
        assert_eq!(store.list_by_status(Status::Claimed).len(), 1);
    }

    #[tokio::test]
    async fn old_claims_return_to_pending() {
        let store = MemoryStore::new();
        store.enqueue(NewWorkItem::new("a"));
        store.try_claim_batch(1, "w1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let sweeper = StaleClaimSweeper::new(Arc::new(store.clone()), Duration::from_millis(10));
        assert_eq!(sweeper.sweep().await.unwrap(), 1);
        let pending = store.list_by_status(Status::Pending);
        assert_eq!(pending.len(), 1);
        assert!(pending[0].owner.is_none());
        assert!(pending[0].claimed_at.is_none());
    }
}
