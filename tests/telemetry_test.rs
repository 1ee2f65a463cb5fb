//! Integration tests for telemetry initialization and span helpers.

use workq::model::WorkId;

#[test]
fn telemetry_initializes_without_endpoint() {
    // Only one global subscriber per process; a second init may return Err,
    // which is acceptable here.
    let config = workq::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "workq-test".to_string(),
        log_level: "debug".to_string(),
    };
    let _guard = workq::telemetry::init_telemetry(config);
}

#[test]
fn iteration_span_records_claimed_count() {
    let span = workq::telemetry::work::start_iteration_span("worker-0", 7);
    workq::telemetry::work::record_claimed(&span, 100);
}

#[test]
fn item_span_records_transition() {
    let span = workq::telemetry::work::start_item_span("resize", &WorkId::new(), 2);
    workq::telemetry::work::record_status_transition(&span, "claimed", "done");
}
