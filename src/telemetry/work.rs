//! Claim and loop span helpers.
//!
//! Provides span creation and status-transition recording for work items
//! flowing through the worker loops.

use tracing::Span;

use crate::model::WorkId;

/// Start a span for one loop iteration.
///
/// The `work.claimed` field is declared empty and can be filled via
/// [`record_claimed`].
pub fn start_iteration_span(loop_name: &str, iteration: u64) -> Span {
    tracing::info_span!(
        "workq.iteration",
        "workq.loop" = loop_name,
        "workq.iteration" = iteration,
        "work.claimed" = tracing::field::Empty,
    )
}

/// Start a span for processing a single claimed item.
pub fn start_item_span(name: &str, id: &WorkId, attempts: u32) -> Span {
    tracing::info_span!(
        "work.process",
        "work.name" = name,
        "work.id" = %id,
        "work.attempts" = attempts,
    )
}

/// Record the size of the claimed batch on an iteration span.
pub fn record_claimed(span: &Span, count: usize) {
    span.record("work.claimed", count);
}

/// Record a status transition event on the given span.
pub fn record_status_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "status_transition");
    });
}
