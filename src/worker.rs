//! Claim worker: the unit of work that drives the claim protocol.
//!
//! Each iteration claims a batch, hands the items to the application
//! [`Processor`] in order, then finishes the batch: processed items are marked
//! done, everything else goes back to `pending`. A processing error is never
//! recorded as done.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, warn};
use uuid::Uuid;

use crate::claim::ClaimStrategy;
use crate::error::{Error, Result};
use crate::model::{WorkId, WorkItem};
use crate::runner::{Outcome, UnitOfWork, WorkFactory};
use crate::telemetry::work::{record_claimed, record_status_transition, start_item_span};

/// Application logic for a single claimed item.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    async fn process(&self, item: &WorkItem, cancel: &CancellationToken) -> Result<()>;
}

/// Builds one claim-and-process iteration per loop turn.
pub struct ClaimWorker {
    strategy: ClaimStrategy,
    processor: Arc<dyn Processor>,
    batch_size: usize,
    owner: String,
}

impl ClaimWorker {
    pub fn new(strategy: ClaimStrategy, processor: Arc<dyn Processor>, batch_size: usize) -> Self {
        let owner = format!("worker-{}", &Uuid::new_v4().simple().to_string()[..8]);
        Self {
            strategy,
            processor,
            batch_size: batch_size.max(1),
            owner,
        }
    }

    /// Override the owner recorded on claims.
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn owner_name(&self) -> &str {
        &self.owner
    }
}

#[async_trait]
impl WorkFactory for ClaimWorker {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        Ok(Box::new(ClaimIteration {
            strategy: self.strategy.clone(),
            processor: Arc::clone(&self.processor),
            batch_size: self.batch_size,
            owner: self.owner.clone(),
        }))
    }
}

struct ClaimIteration {
    strategy: ClaimStrategy,
    processor: Arc<dyn Processor>,
    batch_size: usize,
    owner: String,
}

#[async_trait]
impl UnitOfWork for ClaimIteration {
    async fn run(&mut self, cancel: &CancellationToken) -> Result<Outcome> {
        if cancel.is_cancelled() {
            return Ok(Outcome::Idle);
        }

        let batch = self.strategy.claim(self.batch_size, &self.owner).await?;
        record_claimed(&Span::current(), batch.len());
        if batch.is_empty() {
            batch.release().await?;
            return Ok(Outcome::Idle);
        }
        debug!(owner = %self.owner, claimed = batch.len(), "processing batch");

        let mut done: Vec<WorkId> = Vec::with_capacity(batch.len());
        let mut failed: Vec<(WorkId, Error)> = Vec::new();
        for item in batch.items() {
            if cancel.is_cancelled() {
                debug!(owner = %self.owner, "cancelled mid-batch; returning the rest");
                break;
            }
            let span = start_item_span(&item.name, &item.id, item.attempts);
            match self
                .processor
                .process(item, cancel)
                .instrument(span.clone())
                .await
            {
                Ok(()) => {
                    record_status_transition(&span, "claimed", "done");
                    done.push(item.id);
                }
                Err(e) => {
                    warn!(parent: &span, error = %e, "processing failed; releasing item");
                    record_status_transition(&span, "claimed", "pending");
                    failed.push((item.id, e));
                }
            }
        }

        let processed = done.len();
        batch.finish(&done).await?;

        match failed.len() {
            0 => Ok(Outcome::Processed(processed)),
            count => {
                let (id, first) = failed.swap_remove(0);
                Err(Error::Process {
                    id: id.to_string(),
                    message: format!("{first} ({count} of the batch failed)"),
                })
            }
        }
    }
}
