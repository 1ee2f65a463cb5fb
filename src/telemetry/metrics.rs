//! Metric instrument factories for workq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"workq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for workq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("workq")
}

/// Counter: work items claimed.
/// Labels: `strategy` ("lease" | "transaction").
pub fn claimed_items() -> Counter<u64> {
    meter()
        .u64_counter("workq.claim.items")
        .with_description("Number of work items claimed")
        .build()
}

/// Counter: work items marked done.
/// Labels: `strategy`.
pub fn completed_items() -> Counter<u64> {
    meter()
        .u64_counter("workq.claim.completed")
        .with_description("Number of work items marked done")
        .build()
}

/// Counter: claimed work items given back to pending by their worker.
/// Labels: `strategy`.
pub fn released_items() -> Counter<u64> {
    meter()
        .u64_counter("workq.claim.released")
        .with_description("Number of claimed work items released by their worker")
        .build()
}

/// Counter: stale claims returned to pending by the sweeper.
pub fn swept_items() -> Counter<u64> {
    meter()
        .u64_counter("workq.sweep.released")
        .with_description("Number of stale claims returned to pending")
        .build()
}

/// Counter: failed loop iterations.
/// Labels: `loop`.
pub fn loop_failures() -> Counter<u64> {
    meter()
        .u64_counter("workq.loop.failures")
        .with_description("Number of failed loop iterations")
        .build()
}

/// Counter: scheduled task firings.
/// Labels: `task`, `result` ("ok" | "error").
pub fn schedule_firings() -> Counter<u64> {
    meter()
        .u64_counter("workq.schedule.firings")
        .with_description("Number of scheduled task firings")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("workq.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
