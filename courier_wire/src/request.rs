//! Assembly of outgoing request bodies: stale-entry pruning, timestamp
//! extraction, protobuf marshal, and compression.

use prost::Message;
use snafu::Snafu;
use tracing::debug;

use crate::compress::{Compression, compress_payload};
use crate::{v1, v2};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EncodeError {
    #[snafu(display("failed to compress request body with {compression}"))]
    Compress {
        compression: Compression,
        source: snap::Error,
    },
    #[snafu(display("failed to decompress request body with {compression}"))]
    Decompress {
        compression: Compression,
        source: snap::Error,
    },
}

/// A compressed request body plus the timestamp range it covers. The lowest
/// timestamp drives stale-entry refiltering on retries; the highest feeds
/// the highest-sent gauge after a successful store.
#[derive(Debug)]
pub struct BuiltRequest {
    pub payload: Vec<u8>,
    pub highest_timestamp: i64,
    pub lowest_timestamp: i64,
}

#[derive(Debug, Default, Clone, Copy)]
struct PrunedCounts {
    samples: usize,
    exemplars: usize,
    histograms: usize,
}

impl PrunedCounts {
    fn any(self) -> bool {
        self.samples > 0 || self.exemplars > 0 || self.histograms > 0
    }
}

/// Optional per-entry rejection predicate. Returning `true` removes the
/// entry from the request; the caller is expected to account for the drop.
pub type SeriesFilter<'a, T> = &'a mut dyn FnMut(&T) -> bool;

macro_rules! prune_entries {
    ($series:expr, $filter:expr) => {{
        let mut highest = 0i64;
        let mut lowest = i64::MAX;
        let mut pruned = PrunedCounts::default();
        $series.retain(|entry| {
            if let Some(filter) = $filter.as_mut() {
                if filter(entry) {
                    pruned.samples += usize::from(!entry.samples.is_empty());
                    pruned.exemplars += usize::from(!entry.exemplars.is_empty());
                    pruned.histograms += usize::from(!entry.histograms.is_empty());
                    return false;
                }
            }
            // Each entry carries exactly one value, so the first element of
            // whichever collection is populated is the entry's timestamp.
            let timestamp = entry
                .samples
                .first()
                .map(|s| s.timestamp)
                .or_else(|| entry.exemplars.first().map(|e| e.timestamp))
                .or_else(|| entry.histograms.first().map(|h| h.timestamp));
            if let Some(timestamp) = timestamp {
                highest = highest.max(timestamp);
                lowest = lowest.min(timestamp);
            }
            true
        });
        (highest, lowest, pruned)
    }};
}

/// Builds a v1 request body from `series` (and, on the legacy metadata
/// path, `metadata` alone). The series vector is pruned in place so a retry
/// re-encodes only the entries that survived earlier filters.
pub fn build_write_request(
    series: &mut Vec<v1::TimeSeries>,
    metadata: &[v1::MetricMetadata],
    mut filter: Option<SeriesFilter<'_, v1::TimeSeries>>,
    compression: Compression,
) -> Result<BuiltRequest, EncodeError> {
    let (highest, lowest, pruned) = prune_entries!(series, filter);
    if pruned.any() {
        debug!(
            samples = pruned.samples,
            exemplars = pruned.exemplars,
            histograms = pruned.histograms,
            "dropped stale entries while building request"
        );
    }

    let request = v1::WriteRequest {
        timeseries: std::mem::take(series),
        metadata: metadata.to_vec(),
    };
    let raw = request.encode_to_vec();
    *series = request.timeseries;

    let payload = compress_payload(&raw, compression)?;
    Ok(BuiltRequest {
        payload,
        highest_timestamp: highest,
        lowest_timestamp: lowest,
    })
}

/// Builds a v2 request body. `symbols` must be the table the series entries
/// were populated against, drained for this request.
pub fn build_v2_write_request(
    series: &mut Vec<v2::TimeSeries>,
    symbols: Vec<String>,
    mut filter: Option<SeriesFilter<'_, v2::TimeSeries>>,
    compression: Compression,
) -> Result<BuiltRequest, EncodeError> {
    let (highest, lowest, pruned) = prune_entries!(series, filter);
    if pruned.any() {
        debug!(
            samples = pruned.samples,
            exemplars = pruned.exemplars,
            histograms = pruned.histograms,
            "dropped stale entries while building request"
        );
    }

    let request = v2::WriteRequest {
        symbols,
        timeseries: std::mem::take(series),
    };
    let raw = request.encode_to_vec();
    *series = request.timeseries;

    let payload = compress_payload(&raw, compression)?;
    Ok(BuiltRequest {
        payload,
        highest_timestamp: highest,
        lowest_timestamp: lowest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::decompress_payload;

    fn sample_entry(timestamp: i64) -> v1::TimeSeries {
        v1::TimeSeries {
            labels: vec![v1::Label {
                name: "__name__".to_owned(),
                value: "up".to_owned(),
            }],
            samples: vec![v1::Sample {
                value: 1.0,
                timestamp,
            }],
            exemplars: Vec::new(),
            histograms: Vec::new(),
        }
    }

    #[test]
    fn timestamp_range_covers_all_entries() {
        let mut series = vec![sample_entry(50), sample_entry(10), sample_entry(30)];
        let built =
            build_write_request(&mut series, &[], None, Compression::Snappy).expect("build");
        assert_eq!(built.highest_timestamp, 50);
        assert_eq!(built.lowest_timestamp, 10);
        assert_eq!(series.len(), 3);
    }

    #[test]
    fn filter_prunes_in_place_and_adjusts_range() {
        let mut series = vec![sample_entry(50), sample_entry(10), sample_entry(30)];
        let mut too_old = |entry: &v1::TimeSeries| entry.samples[0].timestamp < 30;
        let built = build_write_request(
            &mut series,
            &[],
            Some(&mut too_old),
            Compression::Snappy,
        )
        .expect("build");
        assert_eq!(built.lowest_timestamp, 30);
        assert_eq!(series.len(), 2);

        let raw = decompress_payload(&built.payload, Compression::Snappy).expect("decompress");
        let decoded = <v1::WriteRequest as Message>::decode(raw.as_slice()).expect("decode");
        assert_eq!(decoded.timeseries.len(), 2);
    }

    #[test]
    fn v2_round_trip_preserves_symbols() {
        let mut series = vec![v2::TimeSeries {
            labels_refs: vec![0, 1],
            samples: vec![v1::Sample {
                value: 2.0,
                timestamp: 7,
            }],
            histograms: Vec::new(),
            exemplars: Vec::new(),
            metadata: None,
        }];
        let symbols = vec!["__name__".to_owned(), "up".to_owned()];
        let built = build_v2_write_request(&mut series, symbols, None, Compression::Snappy)
            .expect("build");
        let raw = decompress_payload(&built.payload, Compression::Snappy).expect("decompress");
        let decoded = <v2::WriteRequest as Message>::decode(raw.as_slice()).expect("decode");
        assert_eq!(decoded.symbols, ["__name__", "up"]);
        assert_eq!(decoded.timeseries[0].labels_refs, [0, 1]);
    }
}
