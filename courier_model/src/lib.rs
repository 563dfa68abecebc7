pub mod histogram;
pub mod intern;
pub mod labels;
pub mod metadata;
pub mod record;
pub mod relabel;

pub use histogram::{BucketSpan, FloatHistogram, Histogram, ResetHint};
pub use intern::{Interner, NoopInterner};
pub use labels::{Label, LabelBuilder, Labels};
pub use metadata::{FamilyMetadata, Metadata, MetricType};
pub use record::{
    ExemplarRecord, FloatHistogramRecord, HistogramRecord, MetadataRecord, SampleRecord,
    SeriesRecord, SeriesRef,
};
