use std::sync::{Arc, Weak};

use opentelemetry_sdk::error::OTelSdkResult;
use opentelemetry_sdk::metrics::MetricResult;
use opentelemetry_sdk::metrics::data::ResourceMetrics;
use opentelemetry_sdk::metrics::reader::MetricReader;
use opentelemetry_sdk::metrics::{InstrumentKind, ManualReader, Pipeline, Temporality};

/// A pull-based metric reader.
///
/// Registered alongside any push exporters so embedders (and tests) can
/// scrape the current instrument values in process instead of waiting for
/// an export interval.
#[derive(Clone, Debug)]
pub struct MetricsReader {
    inner: Arc<ManualReader>,
}

impl MetricsReader {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ManualReader::builder().build()),
        }
    }
}

impl Default for MetricsReader {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricReader for MetricsReader {
    fn register_pipeline(&self, pipeline: Weak<Pipeline>) {
        self.inner.register_pipeline(pipeline);
    }

    fn collect(&self, metrics: &mut ResourceMetrics) -> MetricResult<()> {
        self.inner.collect(metrics)
    }

    fn force_flush(&self) -> OTelSdkResult {
        self.inner.force_flush()
    }

    fn shutdown(&self) -> OTelSdkResult {
        self.inner.shutdown()
    }

    fn temporality(&self, kind: InstrumentKind) -> Temporality {
        self.inner.temporality(kind)
    }
}
