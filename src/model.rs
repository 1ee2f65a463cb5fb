//! Core data model.
//!
//! A work item is a unit of work sitting in the shared table. Workers move it
//! from `pending` to `claimed` to `done`; a claim that goes stale or is
//! released moves it back to `pending`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A unit of work tracked in the shared store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique identifier. Time-ordered, so id order follows insertion order.
    pub id: WorkId,

    /// Application-defined name (e.g. "send-email").
    pub name: String,

    /// Opaque body for the processor. The engine doesn't interpret it.
    pub payload: serde_json::Value,

    /// Current lifecycle status.
    pub status: Status,

    /// When the current claim was taken. `None` unless `status` is `Claimed`.
    pub claimed_at: Option<DateTime<Utc>>,

    /// Worker holding the current claim, for diagnostics.
    pub owner: Option<String>,

    /// Number of times this item has been claimed.
    pub attempts: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    /// Build a fresh `Pending` item from a submission.
    pub fn from_new(new: NewWorkItem, now: DateTime<Utc>) -> Self {
        Self {
            id: WorkId::new(),
            name: new.name,
            payload: new.payload,
            status: Status::Pending,
            claimed_at: None,
            owner: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Newtype for work item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkId(pub Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Waiting for a worker.
    Pending,
    /// Owned by exactly one worker.
    Claimed,
    /// Processed. Terminal.
    Done,
}

impl Status {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Pending, Claimed)
                | (Claimed, Done)
                | (Claimed, Pending) // released or swept
                | (Pending, Done) // late completion after a sweep
        )
    }

    /// Is this a terminal status?
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Done)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Claimed => "claimed",
            Status::Done => "done",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Status::Pending),
            "claimed" => Ok(Status::Claimed),
            "done" => Ok(Status::Done),
            other => Err(Error::Other(format!("unknown status: {other}"))),
        }
    }
}

/// Validate a status transition, returning an error if disallowed.
pub fn validate_transition(from: Status, to: Status) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Number of items in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub claimed: u64,
    pub done: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.claimed + self.done
    }
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

/// Builder for enqueueing new work.
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    pub name: String,
    pub payload: serde_json::Value,
}

impl NewWorkItem {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: serde_json::json!({}),
        }
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}
