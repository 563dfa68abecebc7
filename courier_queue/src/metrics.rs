//! Instruments for one queue. Every instrument carries `remote_name` and
//! `endpoint` attributes so multiple queues in one process stay apart.
//!
//! The counters the shard controller and embedders read back (pending
//! counts, totals, the highest sent timestamp) are mirrored in atomics;
//! OpenTelemetry instruments are write-only.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use courier_observability::{Counter, Gauge, Histogram, KeyValue, UpDownCounter, meter};

use crate::types::{BatchCounts, DatumKind};

/// Why an item was dropped before (or instead of) being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Older than the configured sample age limit.
    TooOld,
    /// The series was intentionally dropped by relabelling.
    DroppedSeries,
    /// The series ref was never seen, so the item cannot be labelled.
    UnintentionalDroppedSeries,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::TooOld => "too_old",
            DropReason::DroppedSeries => "dropped_series",
            DropReason::UnintentionalDroppedSeries => "unintentionally_dropped_series",
        }
    }

    fn index(self) -> usize {
        match self {
            DropReason::TooOld => 0,
            DropReason::DroppedSeries => 1,
            DropReason::UnintentionalDroppedSeries => 2,
        }
    }
}

#[derive(Debug, Default)]
struct KindTotals {
    sent: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    pending: AtomicI64,
    dropped: [AtomicU64; 3],
    dropped_on_hard_shutdown: AtomicU64,
}

#[derive(Debug, Default)]
struct Totals {
    samples: KindTotals,
    exemplars: KindTotals,
    histograms: KindTotals,
    metadata_sent: AtomicU64,
    metadata_failed: AtomicU64,
    metadata_retried: AtomicU64,
    enqueue_retries: AtomicU64,
    sent_bytes: AtomicU64,
    metadata_bytes: AtomicU64,
    highest_sent_timestamp: AtomicI64,
}

/// A point-in-time copy of the queue's readable counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub samples_sent: u64,
    pub exemplars_sent: u64,
    pub histograms_sent: u64,
    pub metadata_sent: u64,
    pub samples_failed: u64,
    pub exemplars_failed: u64,
    pub histograms_failed: u64,
    pub metadata_failed: u64,
    pub samples_retried: u64,
    pub exemplars_retried: u64,
    pub histograms_retried: u64,
    pub metadata_retried: u64,
    pub pending_samples: i64,
    pub pending_exemplars: i64,
    pub pending_histograms: i64,
    pub samples_dropped_on_hard_shutdown: u64,
    pub exemplars_dropped_on_hard_shutdown: u64,
    pub histograms_dropped_on_hard_shutdown: u64,
    pub enqueue_retries: u64,
    pub sent_bytes: u64,
    pub metadata_bytes: u64,
    /// Milliseconds; the highest timestamp for which a store completed.
    pub highest_sent_timestamp: i64,
}

pub struct QueueMetrics {
    attrs: Vec<KeyValue>,

    samples_sent: Counter<u64>,
    exemplars_sent: Counter<u64>,
    histograms_sent: Counter<u64>,
    metadata_sent: Counter<u64>,
    samples_failed: Counter<u64>,
    exemplars_failed: Counter<u64>,
    histograms_failed: Counter<u64>,
    metadata_failed: Counter<u64>,
    samples_retried: Counter<u64>,
    exemplars_retried: Counter<u64>,
    histograms_retried: Counter<u64>,
    metadata_retried: Counter<u64>,
    samples_dropped: Counter<u64>,
    exemplars_dropped: Counter<u64>,
    histograms_dropped: Counter<u64>,
    samples_pending: UpDownCounter<i64>,
    exemplars_pending: UpDownCounter<i64>,
    histograms_pending: UpDownCounter<i64>,
    enqueue_retries: Counter<u64>,
    send_duration: Histogram<f64>,
    sent_bytes: Counter<u64>,
    metadata_bytes: Counter<u64>,
    highest_sent_seconds: Gauge<f64>,
    shards_current: Gauge<u64>,
    shards_min: Gauge<u64>,
    shards_max: Gauge<u64>,
    shards_desired: Gauge<f64>,
    shard_capacity: Gauge<u64>,
    batch_max_samples: Gauge<u64>,

    totals: Totals,
}

impl QueueMetrics {
    pub fn new(remote_name: &str, endpoint: &str) -> Self {
        let meter = meter("courier_queue");
        let attrs = vec![
            KeyValue::new("remote_name", remote_name.to_owned()),
            KeyValue::new("endpoint", endpoint.to_owned()),
        ];
        Self {
            attrs,
            samples_sent: meter
                .u64_counter("remote_write.samples.sent")
                .with_description("samples the endpoint accepted")
                .build(),
            exemplars_sent: meter.u64_counter("remote_write.exemplars.sent").build(),
            histograms_sent: meter.u64_counter("remote_write.histograms.sent").build(),
            metadata_sent: meter.u64_counter("remote_write.metadata.sent").build(),
            samples_failed: meter
                .u64_counter("remote_write.samples.failed")
                .with_description("samples abandoned after a non-recoverable send error")
                .build(),
            exemplars_failed: meter.u64_counter("remote_write.exemplars.failed").build(),
            histograms_failed: meter.u64_counter("remote_write.histograms.failed").build(),
            metadata_failed: meter.u64_counter("remote_write.metadata.failed").build(),
            samples_retried: meter.u64_counter("remote_write.samples.retried").build(),
            exemplars_retried: meter.u64_counter("remote_write.exemplars.retried").build(),
            histograms_retried: meter.u64_counter("remote_write.histograms.retried").build(),
            metadata_retried: meter.u64_counter("remote_write.metadata.retried").build(),
            samples_dropped: meter
                .u64_counter("remote_write.samples.dropped")
                .with_description("samples dropped before enqueueing, by reason")
                .build(),
            exemplars_dropped: meter.u64_counter("remote_write.exemplars.dropped").build(),
            histograms_dropped: meter.u64_counter("remote_write.histograms.dropped").build(),
            samples_pending: meter
                .i64_up_down_counter("remote_write.samples.pending")
                .build(),
            exemplars_pending: meter
                .i64_up_down_counter("remote_write.exemplars.pending")
                .build(),
            histograms_pending: meter
                .i64_up_down_counter("remote_write.histograms.pending")
                .build(),
            enqueue_retries: meter
                .u64_counter("remote_write.enqueue.retries")
                .with_description("enqueue attempts that found the shard full")
                .build(),
            send_duration: meter
                .f64_histogram("remote_write.send.duration")
                .with_unit("s")
                .build(),
            sent_bytes: meter
                .u64_counter("remote_write.send.bytes")
                .with_unit("By")
                .build(),
            metadata_bytes: meter
                .u64_counter("remote_write.metadata.bytes")
                .with_unit("By")
                .build(),
            highest_sent_seconds: meter
                .f64_gauge("remote_write.send.highest_timestamp")
                .with_unit("s")
                .build(),
            shards_current: meter.u64_gauge("remote_write.shards.current").build(),
            shards_min: meter.u64_gauge("remote_write.shards.min").build(),
            shards_max: meter.u64_gauge("remote_write.shards.max").build(),
            shards_desired: meter.f64_gauge("remote_write.shards.desired").build(),
            shard_capacity: meter.u64_gauge("remote_write.shard.capacity").build(),
            batch_max_samples: meter.u64_gauge("remote_write.batch.max_samples").build(),
            totals: Totals::default(),
        }
    }

    fn kind_totals(&self, kind: DatumKind) -> &KindTotals {
        match kind {
            DatumKind::Sample => &self.totals.samples,
            DatumKind::Exemplar => &self.totals.exemplars,
            DatumKind::Histogram | DatumKind::FloatHistogram => &self.totals.histograms,
        }
    }

    pub(crate) fn count_sent(&self, counts: &BatchCounts) {
        self.samples_sent.add(counts.samples as u64, &self.attrs);
        self.exemplars_sent.add(counts.exemplars as u64, &self.attrs);
        self.histograms_sent
            .add(counts.histograms as u64, &self.attrs);
        self.metadata_sent.add(counts.metadata as u64, &self.attrs);
        self.totals
            .samples
            .sent
            .fetch_add(counts.samples as u64, Ordering::Relaxed);
        self.totals
            .exemplars
            .sent
            .fetch_add(counts.exemplars as u64, Ordering::Relaxed);
        self.totals
            .histograms
            .sent
            .fetch_add(counts.histograms as u64, Ordering::Relaxed);
        self.totals
            .metadata_sent
            .fetch_add(counts.metadata as u64, Ordering::Relaxed);
    }

    pub(crate) fn count_failed(&self, counts: &BatchCounts) {
        self.samples_failed.add(counts.samples as u64, &self.attrs);
        self.exemplars_failed
            .add(counts.exemplars as u64, &self.attrs);
        self.histograms_failed
            .add(counts.histograms as u64, &self.attrs);
        self.totals
            .samples
            .failed
            .fetch_add(counts.samples as u64, Ordering::Relaxed);
        self.totals
            .exemplars
            .failed
            .fetch_add(counts.exemplars as u64, Ordering::Relaxed);
        self.totals
            .histograms
            .failed
            .fetch_add(counts.histograms as u64, Ordering::Relaxed);
    }

    pub(crate) fn count_retried(&self, counts: &BatchCounts) {
        self.samples_retried.add(counts.samples as u64, &self.attrs);
        self.exemplars_retried
            .add(counts.exemplars as u64, &self.attrs);
        self.histograms_retried
            .add(counts.histograms as u64, &self.attrs);
        self.totals
            .samples
            .retried
            .fetch_add(counts.samples as u64, Ordering::Relaxed);
        self.totals
            .exemplars
            .retried
            .fetch_add(counts.exemplars as u64, Ordering::Relaxed);
        self.totals
            .histograms
            .retried
            .fetch_add(counts.histograms as u64, Ordering::Relaxed);
    }

    pub(crate) fn inc_failed_metadata(&self, count: usize) {
        self.metadata_failed.add(count as u64, &self.attrs);
        self.totals
            .metadata_failed
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn inc_retried_metadata(&self, count: usize) {
        self.metadata_retried.add(count as u64, &self.attrs);
        self.totals
            .metadata_retried
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn inc_sent_metadata(&self, count: usize) {
        self.metadata_sent.add(count as u64, &self.attrs);
        self.totals
            .metadata_sent
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn inc_dropped(&self, kind: DatumKind, reason: DropReason) {
        self.add_dropped(kind, reason, 1);
    }

    pub(crate) fn add_dropped(&self, kind: DatumKind, reason: DropReason, count: u64) {
        let mut attrs = self.attrs.clone();
        attrs.push(KeyValue::new("reason", reason.as_str()));
        match kind {
            DatumKind::Sample => self.samples_dropped.add(count, &attrs),
            DatumKind::Exemplar => self.exemplars_dropped.add(count, &attrs),
            DatumKind::Histogram | DatumKind::FloatHistogram => {
                self.histograms_dropped.add(count, &attrs)
            }
        }
        self.kind_totals(kind).dropped[reason.index()].fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn inc_pending(&self, kind: DatumKind) {
        match kind {
            DatumKind::Sample => self.samples_pending.add(1, &self.attrs),
            DatumKind::Exemplar => self.exemplars_pending.add(1, &self.attrs),
            DatumKind::Histogram | DatumKind::FloatHistogram => {
                self.histograms_pending.add(1, &self.attrs)
            }
        }
        self.kind_totals(kind).pending.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn sub_pending(&self, kind: DatumKind, count: i64) {
        match kind {
            DatumKind::Sample => self.samples_pending.add(-count, &self.attrs),
            DatumKind::Exemplar => self.exemplars_pending.add(-count, &self.attrs),
            DatumKind::Histogram | DatumKind::FloatHistogram => {
                self.histograms_pending.add(-count, &self.attrs)
            }
        }
        self.kind_totals(kind).pending.fetch_sub(count, Ordering::Relaxed);
    }

    pub(crate) fn add_dropped_on_hard_shutdown(&self, kind: DatumKind, count: u64) {
        self.kind_totals(kind)
            .dropped_on_hard_shutdown
            .fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn inc_enqueue_retries(&self) {
        self.enqueue_retries.add(1, &self.attrs);
        self.totals.enqueue_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn observe_send_duration(&self, seconds: f64) {
        self.send_duration.record(seconds, &self.attrs);
    }

    pub(crate) fn add_sent_bytes(&self, bytes: usize) {
        self.sent_bytes.add(bytes as u64, &self.attrs);
        self.totals
            .sent_bytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_metadata_bytes(&self, bytes: usize) {
        self.metadata_bytes.add(bytes as u64, &self.attrs);
        self.totals
            .metadata_bytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_highest_sent(&self, timestamp_ms: i64) {
        self.totals
            .highest_sent_timestamp
            .fetch_max(timestamp_ms, Ordering::Relaxed);
        let max = self.totals.highest_sent_timestamp.load(Ordering::Relaxed);
        self.highest_sent_seconds
            .record(max as f64 / 1_000.0, &self.attrs);
    }

    pub(crate) fn record_shards(&self, current: usize) {
        self.shards_current.record(current as u64, &self.attrs);
    }

    pub(crate) fn record_shard_limits(&self, min: usize, max: usize) {
        self.shards_min.record(min as u64, &self.attrs);
        self.shards_max.record(max as u64, &self.attrs);
    }

    pub(crate) fn record_desired_shards(&self, desired: f64) {
        self.shards_desired.record(desired, &self.attrs);
    }

    pub(crate) fn record_batch_settings(&self, shard_capacity: usize, max_samples: usize) {
        self.shard_capacity.record(shard_capacity as u64, &self.attrs);
        self.batch_max_samples.record(max_samples as u64, &self.attrs);
    }

    /// Total drops for one kind and reason since the queue was created.
    pub fn dropped_total(&self, kind: DatumKind, reason: DropReason) -> u64 {
        self.kind_totals(kind).dropped[reason.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let totals = &self.totals;
        QueueSnapshot {
            samples_sent: totals.samples.sent.load(Ordering::Relaxed),
            exemplars_sent: totals.exemplars.sent.load(Ordering::Relaxed),
            histograms_sent: totals.histograms.sent.load(Ordering::Relaxed),
            metadata_sent: totals.metadata_sent.load(Ordering::Relaxed),
            samples_failed: totals.samples.failed.load(Ordering::Relaxed),
            exemplars_failed: totals.exemplars.failed.load(Ordering::Relaxed),
            histograms_failed: totals.histograms.failed.load(Ordering::Relaxed),
            metadata_failed: totals.metadata_failed.load(Ordering::Relaxed),
            samples_retried: totals.samples.retried.load(Ordering::Relaxed),
            exemplars_retried: totals.exemplars.retried.load(Ordering::Relaxed),
            histograms_retried: totals.histograms.retried.load(Ordering::Relaxed),
            metadata_retried: totals.metadata_retried.load(Ordering::Relaxed),
            pending_samples: totals.samples.pending.load(Ordering::Relaxed),
            pending_exemplars: totals.exemplars.pending.load(Ordering::Relaxed),
            pending_histograms: totals.histograms.pending.load(Ordering::Relaxed),
            samples_dropped_on_hard_shutdown: totals
                .samples
                .dropped_on_hard_shutdown
                .load(Ordering::Relaxed),
            exemplars_dropped_on_hard_shutdown: totals
                .exemplars
                .dropped_on_hard_shutdown
                .load(Ordering::Relaxed),
            histograms_dropped_on_hard_shutdown: totals
                .histograms
                .dropped_on_hard_shutdown
                .load(Ordering::Relaxed),
            enqueue_retries: totals.enqueue_retries.load(Ordering::Relaxed),
            sent_bytes: totals.sent_bytes.load(Ordering::Relaxed),
            metadata_bytes: totals.metadata_bytes.load(Ordering::Relaxed),
            highest_sent_timestamp: totals.highest_sent_timestamp.load(Ordering::Relaxed),
        }
    }
}
