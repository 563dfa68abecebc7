//! Native histogram values in their two flavours: integer buckets with
//! delta-encoded counts, and float buckets with absolute counts.

/// One run of contiguous buckets in a sparse histogram layout.
///
/// `offset` is relative to the end of the previous span (or to the zero
/// bucket for the first span), `length` is the number of buckets the span
/// covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BucketSpan {
    pub offset: i32,
    pub length: u32,
}

impl BucketSpan {
    pub fn new(offset: i32, length: u32) -> Self {
        Self { offset, length }
    }
}

/// Whether the histogram's counters may have reset since the previous
/// sample of the same series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResetHint {
    #[default]
    Unknown,
    Yes,
    No,
    Gauge,
}

/// An integer-bucket histogram. Bucket counts are delta-encoded: each entry
/// in the delta slices is the difference to the previous bucket's absolute
/// count.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Histogram {
    pub count: u64,
    pub sum: f64,
    /// Resolution exponent; bucket boundaries grow by 2^(2^-schema).
    pub schema: i32,
    pub zero_threshold: f64,
    pub zero_count: u64,
    pub negative_spans: Vec<BucketSpan>,
    pub negative_deltas: Vec<i64>,
    pub positive_spans: Vec<BucketSpan>,
    pub positive_deltas: Vec<i64>,
    pub reset_hint: ResetHint,
}

/// A float-bucket histogram. Bucket counts are absolute floats, which also
/// covers scraped gauge histograms and weighted observations.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FloatHistogram {
    pub count: f64,
    pub sum: f64,
    pub schema: i32,
    pub zero_threshold: f64,
    pub zero_count: f64,
    pub negative_spans: Vec<BucketSpan>,
    pub negative_buckets: Vec<f64>,
    pub positive_spans: Vec<BucketSpan>,
    pub positive_buckets: Vec<f64>,
    pub reset_hint: ResetHint,
}
