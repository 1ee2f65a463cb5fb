//! Work item operations: enqueue, lookup, and status counts.

use crate::error::{Error, Result};
use crate::model::*;
use uuid::Uuid;

/// Column list shared by every query that materializes a [`WorkItem`].
pub(crate) const WORK_ITEM_COLUMNS: &str =
    "id, name, payload, status, claimed_at, owner, attempts, created_at, updated_at";

impl super::Db {
    /// Insert a new pending work item.
    pub async fn enqueue(&self, new: NewWorkItem) -> Result<WorkItem> {
        let item = WorkItem::from_new(new, chrono::Utc::now());
        sqlx::query(
            "INSERT INTO work_items (id, name, payload, status, attempts, created_at, updated_at)
             VALUES ($1, $2, $3, 'pending', 0, $4, $4)",
        )
        .bind(item.id.0)
        .bind(&item.name)
        .bind(&item.payload)
        .bind(item.created_at)
        .execute(self.pool())
        .await?;
        Ok(item)
    }

    /// Insert many pending items in one transaction.
    pub async fn enqueue_many(&self, items: Vec<NewWorkItem>) -> Result<Vec<WorkItem>> {
        let now = chrono::Utc::now();
        let items: Vec<WorkItem> = items
            .into_iter()
            .map(|new| WorkItem::from_new(new, now))
            .collect();

        let ids: Vec<Uuid> = items.iter().map(|i| i.id.0).collect();
        let names: Vec<String> = items.iter().map(|i| i.name.clone()).collect();
        let payloads: Vec<serde_json::Value> = items.iter().map(|i| i.payload.clone()).collect();

        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "INSERT INTO work_items (id, name, payload, status, attempts, created_at, updated_at)
             SELECT id, name, payload, 'pending', 0, $4, $4
             FROM UNNEST($1::uuid[], $2::text[], $3::jsonb[]) AS t(id, name, payload)",
        )
        .bind(&ids)
        .bind(&names)
        .bind(&payloads)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(items)
    }

    /// Get a work item by ID.
    pub async fn get_work_item(&self, id: WorkId) -> Result<WorkItem> {
        let row: Option<WorkItemRow> = sqlx::query_as(&format!(
            "SELECT {WORK_ITEM_COLUMNS} FROM work_items WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(self.pool())
        .await?;

        row.ok_or_else(|| Error::NotFound(format!("work item {id}")))?
            .try_into_work_item()
    }

    /// List work items in a status, oldest first.
    pub async fn list_by_status(&self, status: Status, limit: i64) -> Result<Vec<WorkItem>> {
        let rows: Vec<WorkItemRow> = sqlx::query_as(&format!(
            "SELECT {WORK_ITEM_COLUMNS} FROM work_items
             WHERE status = $1
             ORDER BY created_at, id
             LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(WorkItemRow::try_into_work_item)
            .collect()
    }

    /// Count items in each status.
    pub async fn count_by_status(&self) -> Result<StatusCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, count(*) FROM work_items GROUP BY status")
                .fetch_all(self.pool())
                .await?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            let n = n as u64;
            match status.parse()? {
                Status::Pending => counts.pending = n,
                Status::Claimed => counts.claimed = n,
                Status::Done => counts.done = n,
            }
        }
        Ok(counts)
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
pub(crate) struct WorkItemRow {
    id: Uuid,
    name: String,
    payload: serde_json::Value,
    status: String,
    claimed_at: Option<chrono::DateTime<chrono::Utc>>,
    owner: Option<String>,
    attempts: i32,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl WorkItemRow {
    pub(crate) fn try_into_work_item(self) -> Result<WorkItem> {
        Ok(WorkItem {
            id: WorkId(self.id),
            name: self.name,
            payload: self.payload,
            status: self.status.parse()?,
            claimed_at: self.claimed_at,
            owner: self.owner,
            attempts: self.attempts as u32,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
