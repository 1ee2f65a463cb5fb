//! Tracing and OpenTelemetry initialization.
//!
//! Every loop, claim, and scheduled firing logs through `tracing`. If an
//! OTLP endpoint is configured, spans, metrics, and log records are also
//! exported there; otherwise only the fmt layer writes to stderr.

pub mod metrics;
pub mod work;

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;

use crate::error::{Error, Result};

/// Name of the tracer every workq span is created under.
const TRACER_NAME: &str = "workq";

/// Configuration for telemetry initialization.
pub struct TelemetryConfig {
    /// Optional OTLP gRPC endpoint (e.g. "http://localhost:4317").
    /// When `None`, only the fmt layer is installed.
    pub endpoint: Option<String>,
    /// Reported as `service.name`; also the Loki stream label.
    pub service_name: String,
    /// Filter directive used when `RUST_LOG` is unset (e.g. "info").
    pub log_level: String,
}

/// The three OTLP pipelines, built against one resource.
struct OtlpProviders {
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
    logger: SdkLoggerProvider,
}

impl OtlpProviders {
    fn build(endpoint: &str, resource: Resource) -> Result<Self> {
        let spans = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("span", e))?;
        let metrics = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("metric", e))?;
        let logs = opentelemetry_otlp::LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("log", e))?;

        Ok(Self {
            tracer: SdkTracerProvider::builder()
                .with_batch_exporter(spans)
                .with_resource(resource.clone())
                .build(),
            meter: SdkMeterProvider::builder()
                .with_periodic_exporter(metrics)
                .with_resource(resource.clone())
                .build(),
            logger: SdkLoggerProvider::builder()
                .with_batch_exporter(logs)
                .with_resource(resource)
                .build(),
        })
    }
}

fn exporter_error(signal: &str, err: impl std::fmt::Display) -> Error {
    Error::Other(format!("failed to create OTLP {signal} exporter: {err}"))
}

fn resource(service_name: String) -> Resource {
    Resource::builder()
        .with_service_name(service_name)
        .with_attribute(KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ))
        .build()
}

/// Keeps the OTLP pipelines alive; flushes and shuts them down on drop.
///
/// Hold it for as long as the process runs. Without an endpoint it is inert.
pub struct TelemetryGuard {
    providers: Option<OtlpProviders>,
}

impl TelemetryGuard {
    /// Push buffered spans, metrics, and logs out now.
    ///
    /// Tests call this before querying the backends.
    pub fn force_flush(&self) {
        if let Some(p) = &self.providers {
            let _ = p.tracer.force_flush();
            let _ = p.meter.force_flush();
            let _ = p.logger.force_flush();
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        // Logs first, traces last.
        if let Some(p) = self.providers.take() {
            let _ = p.logger.shutdown();
            let _ = p.meter.shutdown();
            let _ = p.tracer.shutdown();
        }
    }
}

/// Install the global subscriber and, with an endpoint, the OTLP pipelines.
///
/// # Errors
///
/// Fails if an OTLP exporter cannot be built or a global subscriber is
/// already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    use opentelemetry::trace::TracerProvider as _;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    let subscriber_error = |e: tracing_subscriber::util::TryInitError| {
        Error::Other(format!("failed to init tracing subscriber: {e}"))
    };

    let Some(endpoint) = config.endpoint else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(subscriber_error)?;
        return Ok(TelemetryGuard { providers: None });
    };

    let providers = OtlpProviders::build(&endpoint, resource(config.service_name))?;
    opentelemetry::global::set_meter_provider(providers.meter.clone());

    let trace_layer =
        tracing_opentelemetry::layer().with_tracer(providers.tracer.tracer(TRACER_NAME));
    let log_layer = opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(
        &providers.logger,
    );

    // Operators still get compact worker logs on stderr next to the export.
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .with(trace_layer)
        .with(log_layer)
        .try_init()
        .map_err(subscriber_error)?;

    Ok(TelemetryGuard {
        providers: Some(providers),
    })
}
