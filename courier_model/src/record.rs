//! Record types handed to the queue by the log reader. Timestamps are
//! milliseconds since the Unix epoch throughout.

use crate::histogram::{FloatHistogram, Histogram};
use crate::labels::Labels;
use crate::metadata::MetricType;

/// Opaque 64-bit series identifier assigned by the log. Only meaningful
/// within one process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesRef(pub u64);

impl std::fmt::Display for SeriesRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    pub series: SeriesRef,
    pub timestamp: i64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExemplarRecord {
    pub series: SeriesRef,
    pub timestamp: i64,
    pub value: f64,
    /// Labels of the exemplar itself, e.g. a trace id. Distinct from the
    /// labels of the series the exemplar is attached to.
    pub labels: Labels,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistogramRecord {
    pub series: SeriesRef,
    pub timestamp: i64,
    pub histogram: Histogram,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FloatHistogramRecord {
    pub series: SeriesRef,
    pub timestamp: i64,
    pub histogram: FloatHistogram,
}

/// A series definition record: the raw labels as they appear in the log,
/// before relabelling and external labels are applied.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesRecord {
    pub series: SeriesRef,
    pub labels: Labels,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetadataRecord {
    pub series: SeriesRef,
    pub metric_type: MetricType,
    pub unit: String,
    pub help: String,
}
