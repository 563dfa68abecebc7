//! Conversions from the in-memory model to both protobuf generations.

use courier_model::{FloatHistogram, Histogram, Labels, MetricType, ResetHint};

use crate::symbols::SymbolTable;
use crate::{v1, v2};

pub fn labels_to_proto(labels: &Labels) -> Vec<v1::Label> {
    labels
        .iter()
        .map(|label| v1::Label {
            name: label.name.clone(),
            value: label.value.clone(),
        })
        .collect()
}

/// Encodes a label set as alternating name/value symbol offsets.
pub fn labels_to_refs(labels: &Labels, symbols: &mut SymbolTable) -> Vec<u32> {
    let mut refs = Vec::with_capacity(labels.len() * 2);
    for label in labels.iter() {
        refs.push(symbols.ref_for(&label.name));
        refs.push(symbols.ref_for(&label.value));
    }
    refs
}

pub fn metric_type_to_proto(metric_type: MetricType) -> v1::MetricType {
    match metric_type {
        MetricType::Unknown => v1::MetricType::Unknown,
        MetricType::Counter => v1::MetricType::Counter,
        MetricType::Gauge => v1::MetricType::Gauge,
        MetricType::Histogram => v1::MetricType::Histogram,
        MetricType::GaugeHistogram => v1::MetricType::Gaugehistogram,
        MetricType::Summary => v1::MetricType::Summary,
        MetricType::Info => v1::MetricType::Info,
        MetricType::StateSet => v1::MetricType::Stateset,
    }
}

fn reset_hint_to_proto(hint: ResetHint) -> v1::ResetHint {
    match hint {
        ResetHint::Unknown => v1::ResetHint::Unknown,
        ResetHint::Yes => v1::ResetHint::Yes,
        ResetHint::No => v1::ResetHint::No,
        ResetHint::Gauge => v1::ResetHint::Gauge,
    }
}

fn spans_to_proto(spans: &[courier_model::BucketSpan]) -> Vec<v1::BucketSpan> {
    spans
        .iter()
        .map(|span| v1::BucketSpan {
            offset: span.offset,
            length: span.length,
        })
        .collect()
}

pub fn histogram_to_proto(timestamp: i64, histogram: &Histogram) -> v1::Histogram {
    v1::Histogram {
        count: Some(v1::histogram::Count::CountInt(histogram.count)),
        sum: histogram.sum,
        schema: histogram.schema,
        zero_threshold: histogram.zero_threshold,
        zero_count: Some(v1::histogram::ZeroCount::ZeroCountInt(histogram.zero_count)),
        negative_spans: spans_to_proto(&histogram.negative_spans),
        negative_deltas: histogram.negative_deltas.clone(),
        negative_counts: Vec::new(),
        positive_spans: spans_to_proto(&histogram.positive_spans),
        positive_deltas: histogram.positive_deltas.clone(),
        positive_counts: Vec::new(),
        reset_hint: reset_hint_to_proto(histogram.reset_hint) as i32,
        timestamp,
    }
}

pub fn float_histogram_to_proto(timestamp: i64, histogram: &FloatHistogram) -> v1::Histogram {
    v1::Histogram {
        count: Some(v1::histogram::Count::CountFloat(histogram.count)),
        sum: histogram.sum,
        schema: histogram.schema,
        zero_threshold: histogram.zero_threshold,
        zero_count: Some(v1::histogram::ZeroCount::ZeroCountFloat(
            histogram.zero_count,
        )),
        negative_spans: spans_to_proto(&histogram.negative_spans),
        negative_deltas: Vec::new(),
        negative_counts: histogram.negative_buckets.clone(),
        positive_spans: spans_to_proto(&histogram.positive_spans),
        positive_deltas: Vec::new(),
        positive_counts: histogram.positive_buckets.clone(),
        reset_hint: reset_hint_to_proto(histogram.reset_hint) as i32,
        timestamp,
    }
}

/// Inline v2 metadata for one series. Help and unit each get their own
/// symbol offset.
pub fn metadata_to_proto(
    metadata: &courier_model::Metadata,
    symbols: &mut SymbolTable,
) -> v2::Metadata {
    v2::Metadata {
        metric_type: metric_type_to_proto(metadata.metric_type) as i32,
        help_ref: symbols.ref_for(&metadata.help),
        unit_ref: symbols.ref_for(&metadata.unit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_model::Metadata;

    #[test]
    fn label_refs_alternate_and_share_symbols() {
        let mut symbols = SymbolTable::new();
        let labels = Labels::from_pairs([("job", "api"), ("zone", "api")]);
        let refs = labels_to_refs(&labels, &mut symbols);
        // "api" is interned once and referenced twice.
        assert_eq!(refs, vec![0, 1, 2, 1]);
        assert_eq!(symbols.symbols(), ["job", "api", "zone"]);
    }

    #[test]
    fn metadata_help_and_unit_get_distinct_refs() {
        let mut symbols = SymbolTable::new();
        let proto = metadata_to_proto(
            &Metadata {
                metric_type: MetricType::Counter,
                unit: "seconds".to_owned(),
                help: "Total time spent".to_owned(),
            },
            &mut symbols,
        );
        assert_ne!(proto.help_ref, proto.unit_ref);
        assert_eq!(symbols.symbols()[proto.help_ref as usize], "Total time spent");
        assert_eq!(symbols.symbols()[proto.unit_ref as usize], "seconds");
    }
}
