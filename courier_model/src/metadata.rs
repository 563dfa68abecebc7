/// The advertised type of a metric family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetricType {
    #[default]
    Unknown,
    Counter,
    Gauge,
    Histogram,
    GaugeHistogram,
    Summary,
    Info,
    StateSet,
}

/// Scrape-time metadata attached to a series: its family type plus the
/// free-form unit and help strings.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Metadata {
    pub metric_type: MetricType,
    pub unit: String,
    pub help: String,
}

/// Metadata keyed by metric family name rather than series ref, as
/// delivered by a scrape-time metadata source. Only used on the legacy v1
/// metadata path.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FamilyMetadata {
    pub metric_family_name: String,
    pub metric_type: MetricType,
    pub unit: String,
    pub help: String,
}
