//! # Telemetry
//!
//! Console logging is always on: a `tracing_subscriber` registry with an
//! `EnvFilter` (`RUST_LOG`, default `info`) and a pretty `fmt` layer.
//!
//! OpenTelemetry export is opt-in through cargo features:
//!
//! - `traces`: exports spans (one per HTTP request and one per generation).
//! - `metrics`: exports counters and histograms for admissions, rejections,
//!   in-flight streams, cancellations, failures, stream duration, streamed
//!   tokens and prompt length.
//! - `honeycomb`: OTLP/gRPC exporter configured from `HONEYCOMB_*` variables.
//! - `stdout`: OTLP exporter that prints to stdout.
//!
//! Exporters require at least one of `traces` or `metrics`. Both exporters may
//! be enabled together.
//!
//! Events emitted outside a span only reach the console; events inside a span
//! also become span events when `traces` is enabled.
//!
//! ```bash
//! cargo run --features traces,metrics,honeycomb
//! cargo run --features traces,stdout
//! ```
//!
//! The `record_*` / `increment_*` helpers compile to no-ops without
//! `metrics`, so call sites never need feature gates.

#[cfg(all(feature = "honeycomb", not(any(feature = "traces", feature = "metrics"))))]
compile_error!(
    "The 'honeycomb' feature requires at least one of 'traces' or 'metrics' to be enabled."
);

#[cfg(all(feature = "stdout", not(any(feature = "traces", feature = "metrics"))))]
compile_error!("The 'stdout' feature requires at least one of 'traces' or 'metrics' to be enabled.");

use singlet_core::types::CancelReason;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(all(feature = "honeycomb", any(feature = "metrics", feature = "traces")))]
use opentelemetry_otlp::{Compression, Protocol, WithExportConfig, WithTonicConfig};
#[cfg(all(feature = "honeycomb", feature = "metrics"))]
use opentelemetry_sdk::metrics::Temporality;
#[cfg(feature = "honeycomb")]
use tonic::{metadata::MetadataMap, transport::ClientTlsConfig};

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(any(feature = "metrics", feature = "traces"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "traces"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "traces"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(feature = "traces")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "traces")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "traces")]
use opentelemetry_sdk::trace as sdktrace;

const SERVICE_NAME: &str = "singlet";

/// Exporter handles that must be flushed before the process exits.
pub struct TelemetryProviders {
    #[cfg(feature = "traces")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and shuts down every enabled provider. Errors are printed, not
    /// returned: the subscriber may already be gone.
    #[allow(clippy::unused_self)]
    pub fn shutdown(&self) {
        #[cfg(feature = "traces")]
        {
            if let Err(err) = self.tracer_provider.force_flush() {
                eprintln!("Error flushing traces: {err:#?}");
            }
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("Error shutting down tracer: {err:#?}");
            }
        }

        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "traces")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(feature = "traces")]
    let tracer_provider = init_tracer()?;

    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics()?;

    #[cfg(any(feature = "metrics", feature = "traces"))]
    let scope = InstrumentationScope::builder(SERVICE_NAME)
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true)
                .pretty(),
        );

    #[cfg(feature = "traces")]
    let registry = {
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        registry.with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer_with_scope(scope.clone()))
                .with_error_records_to_exceptions(true),
        )
    };

    #[cfg(feature = "metrics")]
    let registry = {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let meter = opentelemetry::global::meter_with_scope(scope);
        let _ = METRICS.set(Metrics::new(&meter));

        registry.with(tracing_opentelemetry::MetricsLayer::new(
            meter_provider.clone(),
        ))
    };

    registry.try_init()?;

    Ok(TelemetryProviders {
        #[cfg(feature = "traces")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(feature = "honeycomb")]
struct HoneycombSettings {
    metadata: MetadataMap,
    endpoint: String,
    compression: Compression,
}

#[cfg(feature = "honeycomb")]
fn honeycomb_settings() -> anyhow::Result<HoneycombSettings> {
    use anyhow::Context;
    use std::str::FromStr;

    let api_key = std::env::var("HONEYCOMB_API_KEY").context("missing `HONEYCOMB_API_KEY`")?;
    let dataset = std::env::var("HONEYCOMB_DATASET").context("missing `HONEYCOMB_DATASET`")?;
    let endpoint = std::env::var("HONEYCOMB_ENDPOINT").context("missing `HONEYCOMB_ENDPOINT`")?;
    let compression = std::env::var("HONEYCOMB_COMPRESSION")
        .context("missing `HONEYCOMB_COMPRESSION`")?
        .to_ascii_lowercase();

    let mut metadata = MetadataMap::new();
    metadata.insert(
        "x-honeycomb-team",
        api_key.parse().context("invalid API key")?,
    );
    metadata.insert(
        "x-honeycomb-dataset",
        dataset.parse().context("invalid dataset")?,
    );

    Ok(HoneycombSettings {
        metadata,
        endpoint,
        compression: Compression::from_str(&compression)?,
    })
}

#[cfg(any(feature = "metrics", feature = "traces"))]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name(SERVICE_NAME)
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "metrics")]
fn init_metrics() -> anyhow::Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        let reader = sdkmetrics::PeriodicReader::builder(opentelemetry_stdout::MetricExporter::default())
            .with_interval(std::time::Duration::from_secs(5))
            .build();
        builder.with_reader(reader)
    };

    #[cfg(feature = "honeycomb")]
    let builder = {
        use anyhow::Context;

        let settings = honeycomb_settings()?;
        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_tls_config(ClientTlsConfig::new().with_native_roots())
            .with_metadata(settings.metadata)
            .with_timeout(std::time::Duration::from_secs(10))
            .with_compression(settings.compression)
            .with_endpoint(settings.endpoint)
            .with_protocol(Protocol::Grpc)
            .with_temporality(Temporality::Delta)
            .build()
            .context("failed to build metrics exporter")?;

        builder.with_periodic_exporter(exporter)
    };

    Ok(builder.build())
}

#[cfg(feature = "traces")]
fn batch_config() -> sdktrace::BatchConfig {
    sdktrace::BatchConfigBuilder::default()
        .with_scheduled_delay(std::time::Duration::from_secs(5))
        .with_max_queue_size(2048)
        .build()
}

#[cfg(feature = "traces")]
fn init_tracer() -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = builder.with_span_processor(
        sdktrace::BatchSpanProcessor::builder(opentelemetry_stdout::SpanExporter::default())
            .with_batch_config(batch_config())
            .build(),
    );

    #[cfg(feature = "honeycomb")]
    let builder = {
        use anyhow::Context;

        let settings = honeycomb_settings()?;
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_tls_config(ClientTlsConfig::new().with_native_roots())
            .with_metadata(settings.metadata)
            .with_timeout(std::time::Duration::from_secs(10))
            .with_compression(settings.compression)
            .with_endpoint(settings.endpoint)
            .with_protocol(Protocol::Grpc)
            .build()
            .context("failed to build tracer exporter")?;

        builder.with_span_processor(
            sdktrace::BatchSpanProcessor::builder(exporter)
                .with_batch_config(batch_config())
                .build(),
        )
    };

    Ok(builder.build())
}

#[cfg(feature = "metrics")]
struct Metrics {
    admitted: Counter<u64>,
    rejected: Counter<u64>,
    streams_inflight: UpDownCounter<i64>,
    cancellations: Counter<u64>,
    failures: Counter<u64>,
    stream_duration_ms: Histogram<f64>,
    tokens_streamed: Counter<u64>,
    prompt_length: Histogram<f64>,
}

#[cfg(feature = "metrics")]
static METRICS: OnceLock<Metrics> = OnceLock::new();

#[cfg(feature = "metrics")]
impl Metrics {
    fn new(meter: &Meter) -> Self {
        Self {
            admitted: meter
                .u64_counter("requests_admitted")
                .with_description("Requests that passed the admission gate")
                .build(),
            rejected: meter
                .u64_counter("requests_rejected")
                .with_description("Requests refused before admission")
                .build(),
            streams_inflight: meter
                .i64_up_down_counter("streams_inflight")
                .with_description("Registered requests")
                .build(),
            cancellations: meter
                .u64_counter("cancellations")
                .with_description("Generations stopped cooperatively, by reason")
                .build(),
            failures: meter
                .u64_counter("generation_failures")
                .with_description("Generations that ended in an engine error")
                .build(),
            stream_duration_ms: meter
                .f64_histogram("stream_duration")
                .with_unit("ms")
                .with_description("Admission to deregistration")
                .build(),
            tokens_streamed: meter
                .u64_counter("tokens_streamed")
                .with_description("Tokens written to response bodies")
                .build(),
            prompt_length: meter
                .f64_histogram("prompt_length")
                .with_description("Prompt length in characters")
                .build(),
        }
    }
}

#[cfg(feature = "metrics")]
fn with_metrics(f: impl FnOnce(&Metrics)) {
    if let Some(metrics) = METRICS.get() {
        f(metrics);
    }
}

#[cfg(feature = "metrics")]
pub fn increment_admitted() {
    with_metrics(|m| m.admitted.add(1, &[]));
}

#[cfg(not(feature = "metrics"))]
pub fn increment_admitted() {}

#[cfg(feature = "metrics")]
pub fn increment_rejected(kind: &'static str) {
    with_metrics(|m| m.rejected.add(1, &[KeyValue::new("kind", kind)]));
}

#[cfg(not(feature = "metrics"))]
pub fn increment_rejected(_kind: &'static str) {}

#[cfg(feature = "metrics")]
pub fn increment_streams_inflight() {
    with_metrics(|m| m.streams_inflight.add(1, &[]));
}

#[cfg(not(feature = "metrics"))]
pub fn increment_streams_inflight() {}

#[cfg(feature = "metrics")]
pub fn decrement_streams_inflight() {
    with_metrics(|m| m.streams_inflight.add(-1, &[]));
}

#[cfg(not(feature = "metrics"))]
pub fn decrement_streams_inflight() {}

#[cfg(feature = "metrics")]
pub fn increment_cancellations(reason: CancelReason) {
    with_metrics(|m| {
        m.cancellations
            .add(1, &[KeyValue::new("reason", reason.to_string())]);
    });
}

#[cfg(not(feature = "metrics"))]
pub fn increment_cancellations(_reason: CancelReason) {}

#[cfg(feature = "metrics")]
pub fn increment_failures() {
    with_metrics(|m| m.failures.add(1, &[]));
}

#[cfg(not(feature = "metrics"))]
pub fn increment_failures() {}

#[cfg(feature = "metrics")]
pub fn record_stream_duration(duration_ms: f64) {
    with_metrics(|m| m.stream_duration_ms.record(duration_ms, &[]));
}

#[cfg(not(feature = "metrics"))]
pub fn record_stream_duration(_duration_ms: f64) {}

#[cfg(feature = "metrics")]
pub fn increment_tokens_streamed(count: u64) {
    with_metrics(|m| m.tokens_streamed.add(count, &[]));
}

#[cfg(not(feature = "metrics"))]
pub fn increment_tokens_streamed(_count: u64) {}

#[cfg(feature = "metrics")]
pub fn record_prompt_length(chars: f64) {
    with_metrics(|m| m.prompt_length.record(chars, &[]));
}

#[cfg(not(feature = "metrics"))]
pub fn record_prompt_length(_chars: f64) {}
