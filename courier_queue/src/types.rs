use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use courier_model::{FloatHistogram, Histogram, Labels, Metadata};
use parking_lot::RwLock;

use crate::client::WriteClient;
use crate::config::QueueOptions;
use crate::ewma::EwmaRate;
use crate::metrics::QueueMetrics;

/// One unit flowing through a shard: a value of one kind plus the series
/// labels it belongs to, and the series metadata when the v2 format ships
/// it inline.
#[derive(Debug, Clone)]
pub(crate) struct Datum {
    pub labels: Labels,
    pub metadata: Option<Metadata>,
    pub timestamp: i64,
    pub value: DatumValue,
}

#[derive(Debug, Clone)]
pub(crate) enum DatumValue {
    Sample(f64),
    Exemplar { value: f64, labels: Labels },
    Histogram(Histogram),
    FloatHistogram(FloatHistogram),
}

impl Datum {
    pub fn kind(&self) -> DatumKind {
        match self.value {
            DatumValue::Sample(_) => DatumKind::Sample,
            DatumValue::Exemplar { .. } => DatumKind::Exemplar,
            DatumValue::Histogram(_) => DatumKind::Histogram,
            DatumValue::FloatHistogram(_) => DatumKind::FloatHistogram,
        }
    }
}

/// The kind of one queued item. Histograms and float histograms share all
/// counters, so most accounting collapses the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatumKind {
    Sample,
    Exemplar,
    Histogram,
    FloatHistogram,
}

/// Counts of what one outgoing request carries, per kind.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct BatchCounts {
    pub samples: usize,
    pub exemplars: usize,
    pub histograms: usize,
    pub metadata: usize,
}

impl BatchCounts {
    pub fn total(&self) -> usize {
        self.samples + self.exemplars + self.histograms + self.metadata
    }
}

/// A monotonically increasing timestamp in milliseconds.
#[derive(Debug, Default)]
pub(crate) struct MaxTimestamp(AtomicI64);

impl MaxTimestamp {
    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn observe(&self, timestamp: i64) {
        self.0.fetch_max(timestamp, Ordering::Relaxed);
    }
}

/// State shared between the queue manager and its shard workers: options,
/// instruments, the rate trackers feeding the shard controller, and the
/// swappable write client.
pub(crate) struct QueueContext {
    pub options: QueueOptions,
    pub metrics: QueueMetrics,
    client: RwLock<Arc<dyn WriteClient>>,

    pub data_in: EwmaRate,
    pub data_out: EwmaRate,
    pub data_dropped: EwmaRate,
    /// Cumulative send time, in nanoseconds, folded into a rate: divided by
    /// the out rate it yields the average time to ship one sample.
    pub data_out_duration: EwmaRate,

    /// Unix seconds of the most recent successful send. Failed or cancelled
    /// sends leave it untouched, which is what keeps the reshard gate
    /// closed while an endpoint is down.
    pub last_send_timestamp: AtomicI64,
    /// Lowest timestamp in the request currently being (re)tried; compared
    /// against the age limit to decide whether to refilter before a retry.
    pub build_request_limit_timestamp: AtomicI64,
    pub highest_sent: MaxTimestamp,
    pub highest_recv: MaxTimestamp,
}

impl QueueContext {
    pub fn new(options: QueueOptions, client: Arc<dyn WriteClient>, rates: [EwmaRate; 4]) -> Self {
        let [data_in, data_out, data_dropped, data_out_duration] = rates;
        let metrics = QueueMetrics::new(client.name(), client.endpoint());
        Self {
            options,
            metrics,
            client: RwLock::new(client),
            data_in,
            data_out,
            data_dropped,
            data_out_duration,
            last_send_timestamp: AtomicI64::new(0),
            build_request_limit_timestamp: AtomicI64::new(0),
            highest_sent: MaxTimestamp::default(),
            highest_recv: MaxTimestamp::default(),
        }
    }

    pub fn client(&self) -> Arc<dyn WriteClient> {
        self.client.read().clone()
    }

    pub fn swap_client(&self, client: Arc<dyn WriteClient>) {
        *self.client.write() = client;
    }
}

pub(crate) fn unix_time_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

pub(crate) fn unix_time_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}
