//! Telemetry bootstrap: a `tracing` subscriber for logs and spans, and an
//! OpenTelemetry meter provider for metrics.
//!
//! Library crates only ever call [`meter`]; wiring providers together is
//! the embedder's job via [`init_telemetry`].

use std::borrow::Cow;
use std::time::Duration;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{InstrumentationScope, global};
use opentelemetry_otlp::{ExporterBuildError, MetricExporter, SpanExporter};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{MeterProviderBuilder, PeriodicReader};
use opentelemetry_sdk::trace::SdkTracerProvider;
use snafu::{ResultExt, Snafu};
use tracing_subscriber::{EnvFilter, prelude::*};

pub use opentelemetry::{
    KeyValue,
    metrics::{Counter, Gauge, Histogram, Meter, UpDownCounter},
};

pub use crate::reader::MetricsReader;

mod reader;

const OTEL_SDK_DISABLED: &str = "OTEL_SDK_DISABLED";
const EXPORT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Snafu)]
pub enum TelemetryError {
    #[snafu(display("failed to build OTLP exporter"))]
    Exporter { source: ExporterBuildError },
}

/// Returns a named meter from the global provider. Instruments created
/// before [`init_telemetry`] runs are no-ops, so crates can build their
/// metric structs eagerly.
pub fn meter(name: &'static str) -> Meter {
    global::meter(name)
}

/// Installs the tracing subscriber and the global meter provider.
///
/// `reader` is always registered so instruments can be scraped in process.
/// OTLP export (metrics and spans) is opt-in through `OTEL_SDK_DISABLED`,
/// which unlike the SDK default we treat as disabled when unset: most
/// deployments of a shipper have no collector next to them.
pub fn init_telemetry(
    service_name: impl Into<Cow<'static, str>>,
    service_version: impl Into<Cow<'static, str>>,
    reader: MetricsReader,
) -> Result<(), TelemetryError> {
    let export_enabled = std::env::var(OTEL_SDK_DISABLED)
        .map(|value| value == "false")
        .unwrap_or(false);

    let resource = Resource::builder().build();
    let scope = InstrumentationScope::builder(service_name)
        .with_version(service_version)
        .build();

    let mut meter_provider = MeterProviderBuilder::default()
        .with_resource(resource.clone())
        .with_reader(reader);
    let mut tracer_provider = SdkTracerProvider::builder().with_resource(resource);

    if export_enabled {
        let metric_exporter = MetricExporter::builder()
            .with_tonic()
            .build()
            .context(ExporterSnafu)?;
        meter_provider = meter_provider.with_reader(
            PeriodicReader::builder(metric_exporter)
                .with_interval(EXPORT_INTERVAL)
                .build(),
        );

        let span_exporter = SpanExporter::builder()
            .with_tonic()
            .build()
            .context(ExporterSnafu)?;
        tracer_provider = tracer_provider.with_batch_exporter(span_exporter);
    }

    let meter_provider = meter_provider.build();
    global::set_meter_provider(meter_provider.clone());

    let tracer_provider = tracer_provider.build();
    let tracer = tracer_provider.tracer_with_scope(scope);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .init();

    Ok(())
}
