//! Claim primitives on Postgres.
//!
//! Lease claims are a single `UPDATE ... RETURNING` whose candidate set comes
//! from `FOR UPDATE SKIP LOCKED`, so concurrent claimers partition the pending
//! rows instead of queueing behind each other. Transaction-scoped claims keep
//! the `FOR UPDATE SKIP LOCKED` locks open inside a [`PgRowLock`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

use super::Db;
use super::work::{WORK_ITEM_COLUMNS, WorkItemRow};
use crate::error::Result;
use crate::model::{WorkId, WorkItem};
use crate::store::{ClaimStore, LockingStore, RowLock};

fn uuids(ids: &[WorkId]) -> Vec<Uuid> {
    ids.iter().map(|id| id.0).collect()
}

fn into_items(rows: Vec<WorkItemRow>) -> Result<Vec<WorkItem>> {
    rows.into_iter()
        .map(WorkItemRow::try_into_work_item)
        .collect()
}

#[async_trait]
impl ClaimStore for Db {
    async fn try_claim_batch(&self, max_items: usize, owner: &str) -> Result<Vec<WorkItem>> {
        let now = Utc::now();
        let rows: Vec<WorkItemRow> = sqlx::query_as(&format!(
            "WITH candidates AS (
                 SELECT id FROM work_items
                 WHERE status = 'pending'
                 ORDER BY created_at, id
                 LIMIT $1
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE work_items w
             SET status = 'claimed', claimed_at = $2, owner = $3,
                 attempts = w.attempts + 1, updated_at = $2
             FROM candidates c
             WHERE w.id = c.id
             RETURNING {}",
            qualified_columns("w")
        ))
        .bind(max_items as i64)
        .bind(now)
        .bind(owner)
        .fetch_all(self.pool())
        .await?;

        // RETURNING order is unspecified.
        let mut items = into_items(rows)?;
        items.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        debug!(owner, claimed = items.len(), "claimed batch");
        Ok(items)
    }

    async fn mark_done(&self, ids: &[WorkId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let rows = sqlx::query(
            "UPDATE work_items
             SET status = 'done', claimed_at = NULL, owner = NULL, updated_at = $2
             WHERE id = ANY($1) AND status <> 'done'",
        )
        .bind(uuids(ids))
        .bind(Utc::now())
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(rows)
    }

    async fn release(&self, ids: &[WorkId], owner: &str) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let rows = sqlx::query(
            "UPDATE work_items
             SET status = 'pending', claimed_at = NULL, owner = NULL, updated_at = $3
             WHERE id = ANY($1) AND status = 'claimed' AND owner = $2",
        )
        .bind(uuids(ids))
        .bind(owner)
        .bind(Utc::now())
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(rows)
    }

    async fn release_stale(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let rows = sqlx::query(
            "UPDATE work_items
             SET status = 'pending', claimed_at = NULL, owner = NULL, updated_at = $2
             WHERE status = 'claimed' AND claimed_at < $1",
        )
        .bind(older_than)
        .bind(Utc::now())
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(rows)
    }
}

#[async_trait]
impl LockingStore for Db {
    async fn lock_batch(&self, max_items: usize) -> Result<Box<dyn RowLock>> {
        let mut tx = self.pool().begin().await?;
        let rows: Vec<WorkItemRow> = sqlx::query_as(&format!(
            "SELECT {WORK_ITEM_COLUMNS} FROM work_items
             WHERE status = 'pending'
             ORDER BY created_at, id
             LIMIT $1
             FOR UPDATE SKIP LOCKED"
        ))
        .bind(max_items as i64)
        .fetch_all(&mut *tx)
        .await?;
        let items = into_items(rows)?;
        debug!(locked = items.len(), "locked batch");
        Ok(Box::new(PgRowLock { tx, items }))
    }

    /// Row-locks every pending row for the duration of one statement.
    /// Claimers racing it see an empty candidate set and idle once; only the
    /// `work status` command calls this.
    async fn count_available(&self) -> Result<u64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT count(*) FROM (
                 SELECT id FROM work_items
                 WHERE status = 'pending'
                 FOR UPDATE SKIP LOCKED
             ) available",
        )
        .fetch_one(self.pool())
        .await?;
        Ok(row.0 as u64)
    }
}

fn qualified_columns(alias: &str) -> String {
    WORK_ITEM_COLUMNS
        .split(", ")
        .map(|col| format!("{alias}.{col}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Row locks held by an open transaction. Dropping the transaction rolls it
/// back, which releases the locks.
pub struct PgRowLock {
    tx: Transaction<'static, Postgres>,
    items: Vec<WorkItem>,
}

#[async_trait]
impl RowLock for PgRowLock {
    fn items(&self) -> &[WorkItem] {
        &self.items
    }

    async fn commit(self: Box<Self>, done: &[WorkId]) -> Result<()> {
        let PgRowLock { mut tx, .. } = *self;
        if !done.is_empty() {
            sqlx::query(
                "UPDATE work_items
                 SET status = 'done', updated_at = $2
                 WHERE id = ANY($1) AND status = 'pending'",
            )
            .bind(uuids(done))
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
