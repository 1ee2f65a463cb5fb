//! # workq
//!
//! Work queue coordination over a shared Postgres table.
//!
//! Workers claim exclusive ownership of work items through the store's atomic
//! primitives (`UPDATE ... RETURNING` over `FOR UPDATE SKIP LOCKED`, or
//! transaction-held row locks), process them, and mark them done. Stale lease
//! claims are swept back to pending on a schedule, and every worker runs inside
//! a supervised loop that survives failing iterations.

pub mod claim;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod runner;
pub mod schedule;
pub mod store;
pub mod sweep;
pub mod telemetry;
pub mod worker;
