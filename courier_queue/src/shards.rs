//! The shard pool: N parallel workers, each owning one [`ShardQueue`] and
//! shipping its batches over the negotiated wire format.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use courier_model::SeriesRef;
use courier_wire::{
    Compression, SymbolTable, WireVersion, build_v2_write_request, build_write_request, convert,
    negotiate, v1, v2,
};
use snafu::ResultExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, error};

use crate::client::{EncodeSnafu, StoreError};
use crate::metrics::DropReason;
use crate::queue::{ShardQueue, next_batch_now};
use crate::retry::{StoreAttempt, send_with_backoff};
use crate::types::{BatchCounts, Datum, DatumKind, DatumValue, QueueContext, unix_time_ms, unix_time_seconds};

/// How many times one batch may be re-encoded after the endpoint refuses
/// the wire format before it is given up on.
const MAX_NEGOTIATION_ROUNDS: usize = 3;

/// Items accepted by one pool instance but not yet handed to the client.
/// Swapped to zero on hard shutdown so concurrent workers account each
/// drop exactly once.
#[derive(Debug, Default)]
pub(crate) struct EnqueuedCounters {
    samples: AtomicI64,
    exemplars: AtomicI64,
    histograms: AtomicI64,
    dropped_samples: AtomicU64,
    dropped_exemplars: AtomicU64,
    dropped_histograms: AtomicU64,
}

impl EnqueuedCounters {
    fn add(&self, kind: DatumKind) {
        match kind {
            DatumKind::Sample => self.samples.fetch_add(1, Ordering::Relaxed),
            DatumKind::Exemplar => self.exemplars.fetch_add(1, Ordering::Relaxed),
            DatumKind::Histogram | DatumKind::FloatHistogram => {
                self.histograms.fetch_add(1, Ordering::Relaxed)
            }
        };
    }

    fn subtract(&self, counts: &BatchCounts) {
        self.samples
            .fetch_sub(counts.samples as i64, Ordering::Relaxed);
        self.exemplars
            .fetch_sub(counts.exemplars as i64, Ordering::Relaxed);
        self.histograms
            .fetch_sub(counts.histograms as i64, Ordering::Relaxed);
    }
}

struct ShardsInner {
    queues: Vec<Arc<ShardQueue>>,
    workers: JoinSet<()>,
    soft_shutdown: CancellationToken,
    hard_shutdown: CancellationToken,
    counters: Arc<EnqueuedCounters>,
}

pub(crate) struct Shards {
    context: Arc<QueueContext>,
    inner: tokio::sync::RwLock<ShardsInner>,
}

impl Shards {
    pub fn new(context: Arc<QueueContext>) -> Self {
        // Until the first start, enqueues are refused.
        let soft_shutdown = CancellationToken::new();
        soft_shutdown.cancel();
        Self {
            context,
            inner: tokio::sync::RwLock::new(ShardsInner {
                queues: Vec::new(),
                workers: JoinSet::new(),
                soft_shutdown,
                hard_shutdown: CancellationToken::new(),
                counters: Arc::new(EnqueuedCounters::default()),
            }),
        }
    }

    /// Spawns a fresh pool of `n` workers. Must not be called while a
    /// previous pool is still running; the reshard loop serializes
    /// stop-then-start for that reason.
    pub async fn start(&self, n: usize) {
        let mut inner = self.inner.write().await;
        self.context.metrics.record_shards(n);

        let soft_shutdown = CancellationToken::new();
        let hard_shutdown = CancellationToken::new();
        let counters = Arc::new(EnqueuedCounters::default());
        let mut queues = Vec::with_capacity(n);
        let mut workers = JoinSet::new();
        let options = &self.context.options;
        let slots = options.capacity / options.max_samples_per_send;
        for shard_id in 0..n {
            let (queue, batches) = ShardQueue::new(options.batch_size(), slots);
            workers.spawn(run_shard(
                Arc::clone(&self.context),
                shard_id,
                Arc::clone(&queue),
                batches,
                hard_shutdown.clone(),
                Arc::clone(&counters),
            ));
            queues.push(queue);
        }

        *inner = ShardsInner {
            queues,
            workers,
            soft_shutdown,
            hard_shutdown,
            counters,
        };
    }

    /// Two-phase shutdown: refuse new enqueues, flush every queue for up to
    /// the flush deadline, then abort whatever is still in flight.
    ///
    /// The soft-shutdown broadcast happens under the read lock so it can
    /// race safely with concurrent `enqueue` calls and with other `stop`s.
    pub async fn stop(&self) {
        {
            let inner = self.inner.read().await;
            inner.soft_shutdown.cancel();
        }

        let mut inner = self.inner.write().await;
        for queue in &inner.queues {
            let queue = Arc::clone(queue);
            let hard_shutdown = inner.hard_shutdown.clone();
            tokio::spawn(async move {
                queue.flush_and_close(hard_shutdown).await;
            });
        }

        let workers = &mut inner.workers;
        let drained = tokio::time::timeout(self.context.options.flush_deadline, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            inner.hard_shutdown.cancel();
            while inner.workers.join_next().await.is_some() {}
        }

        let dropped = inner.counters.dropped_samples.load(Ordering::Relaxed);
        if dropped > 0 {
            error!(count = dropped, "failed to flush all samples on shutdown");
        }
        let dropped = inner.counters.dropped_exemplars.load(Ordering::Relaxed);
        if dropped > 0 {
            error!(count = dropped, "failed to flush all exemplars on shutdown");
        }
        let dropped = inner.counters.dropped_histograms.load(Ordering::Relaxed);
        if dropped > 0 {
            error!(count = dropped, "failed to flush all histograms on shutdown");
        }
    }

    /// Routes one datum to its shard. Hands the datum back when the shard
    /// is full or the pool is shutting down; the caller backs off and
    /// retries.
    pub async fn enqueue(&self, series_ref: SeriesRef, datum: Datum) -> Result<(), Datum> {
        let inner = self.inner.read().await;
        if inner.soft_shutdown.is_cancelled() || inner.queues.is_empty() {
            return Err(datum);
        }
        let shard = (series_ref.0 % inner.queues.len() as u64) as usize;
        let kind = datum.kind();
        inner.queues[shard].append(datum)?;
        self.context.metrics.inc_pending(kind);
        inner.counters.add(kind);
        Ok(())
    }

    /// Number of live shard queues.
    pub async fn len(&self) -> usize {
        self.inner.read().await.queues.len()
    }
}

async fn run_shard(
    context: Arc<QueueContext>,
    shard_id: usize,
    queue: Arc<ShardQueue>,
    mut batches: mpsc::Receiver<Vec<Datum>>,
    hard_shutdown: CancellationToken,
    counters: Arc<EnqueuedCounters>,
) {
    let mut symbols = SymbolTable::new();
    let deadline = tokio::time::sleep(context.options.batch_send_deadline);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;
            _ = hard_shutdown.cancelled() => {
                drop_remaining(&context, &counters);
                return;
            }
            batch = batches.recv() => {
                let Some(batch) = batch else { return };
                send_batch(&context, &counters, &hard_shutdown, shard_id, &batch, &mut symbols, false).await;
                queue.return_for_reuse(batch);
                deadline.as_mut().reset(tokio::time::Instant::now() + context.options.batch_send_deadline);
            }
            _ = &mut deadline => {
                let batch = next_batch_now(&mut batches, &queue);
                send_batch(&context, &counters, &hard_shutdown, shard_id, &batch, &mut symbols, true).await;
                queue.return_for_reuse(batch);
                deadline.as_mut().reset(tokio::time::Instant::now() + context.options.batch_send_deadline);
            }
        }
    }
}

/// Hard-shutdown accounting: everything still enqueued in this pool is
/// failed and recorded as dropped.
fn drop_remaining(context: &QueueContext, counters: &EnqueuedCounters) {
    let samples = counters.samples.swap(0, Ordering::Relaxed);
    let exemplars = counters.exemplars.swap(0, Ordering::Relaxed);
    let histograms = counters.histograms.swap(0, Ordering::Relaxed);
    if samples == 0 && exemplars == 0 && histograms == 0 {
        return;
    }

    let metrics = &context.metrics;
    metrics.sub_pending(DatumKind::Sample, samples);
    metrics.sub_pending(DatumKind::Exemplar, exemplars);
    metrics.sub_pending(DatumKind::Histogram, histograms);
    metrics.count_failed(&BatchCounts {
        samples: samples as usize,
        exemplars: exemplars as usize,
        histograms: histograms as usize,
        metadata: 0,
    });
    metrics.add_dropped_on_hard_shutdown(DatumKind::Sample, samples as u64);
    metrics.add_dropped_on_hard_shutdown(DatumKind::Exemplar, exemplars as u64);
    metrics.add_dropped_on_hard_shutdown(DatumKind::Histogram, histograms as u64);
    counters
        .dropped_samples
        .fetch_add(samples as u64, Ordering::Relaxed);
    counters
        .dropped_exemplars
        .fetch_add(exemplars as u64, Ordering::Relaxed);
    counters
        .dropped_histograms
        .fetch_add(histograms as u64, Ordering::Relaxed);
}

/// Ships one batch, renegotiating the wire format up to
/// [`MAX_NEGOTIATION_ROUNDS`] times if the endpoint refuses it. All other
/// outcomes, success, retry exhaustion, abandonment, are settled inside the
/// send itself.
async fn send_batch(
    context: &QueueContext,
    counters: &EnqueuedCounters,
    hard_shutdown: &CancellationToken,
    shard_id: usize,
    batch: &[Datum],
    symbols: &mut SymbolTable,
    via_deadline: bool,
) {
    if batch.is_empty() {
        return;
    }
    if via_deadline {
        debug!(
            shard = shard_id as u64,
            size = batch.len() as u64,
            "batch deadline reached, sending buffered data"
        );
    }

    let started = Instant::now();
    let mut round = 0;
    let (result, counts) = loop {
        round += 1;
        let last_header = context.client().last_response_header();
        let (compression, version) = negotiate(context.options.wire_format, last_header.as_deref());

        let (result, counts) = match version {
            WireVersion::V1 => {
                let (mut series, counts) = populate_v1_series(batch);
                let result = send_encoded_with_backoff(
                    context,
                    hard_shutdown,
                    EncodedSeries::V1(&mut series),
                    counts,
                    compression,
                    version,
                )
                .await;
                (result, counts)
            }
            WireVersion::V2 => {
                let (mut series, counts) = populate_v2_series(batch, symbols);
                let symbol_strings = symbols.symbols().to_vec();
                let result = send_encoded_with_backoff(
                    context,
                    hard_shutdown,
                    EncodedSeries::V2 {
                        series: &mut series,
                        symbols: symbol_strings,
                    },
                    counts,
                    compression,
                    version,
                )
                .await;
                symbols.clear();
                (result, counts)
            }
        };

        if round >= MAX_NEGOTIATION_ROUNDS
            || !matches!(result, Err(StoreError::Renegotiate { .. }))
        {
            break (result, counts);
        }
        debug!(
            shard = shard_id as u64,
            round = round as u64,
            "endpoint refused wire format, renegotiating"
        );
    };

    update_send_metrics(context, counters, &result, &counts, started.elapsed());
}

/// Settles the books for one finished batch. Rates and pending counts move
/// on every outcome; failure counters only when the batch was actually
/// abandoned, so a cancelled pool does not pollute them.
fn update_send_metrics(
    context: &QueueContext,
    counters: &EnqueuedCounters,
    result: &Result<(), StoreError>,
    counts: &BatchCounts,
    elapsed: std::time::Duration,
) {
    if let Err(error) = result {
        if !error.is_cancelled() {
            error!(
                error = %error,
                samples = counts.samples as u64,
                exemplars = counts.exemplars as u64,
                histograms = counts.histograms as u64,
                "non-recoverable error while sending batch"
            );
            context.metrics.count_failed(counts);
        }
    }

    context.data_out.incr(counts.total() as i64);
    context.data_out_duration.incr(elapsed.as_nanos() as i64);
    if result.is_ok() {
        // The reshard gate keys off successful sends only.
        context
            .last_send_timestamp
            .store(unix_time_seconds(), Ordering::Relaxed);
    }
    context
        .metrics
        .sub_pending(DatumKind::Sample, counts.samples as i64);
    context
        .metrics
        .sub_pending(DatumKind::Exemplar, counts.exemplars as i64);
    context
        .metrics
        .sub_pending(DatumKind::Histogram, counts.histograms as i64);
    counters.subtract(counts);
}

fn populate_v1_series(batch: &[Datum]) -> (Vec<v1::TimeSeries>, BatchCounts) {
    let mut series = Vec::with_capacity(batch.len());
    let mut counts = BatchCounts::default();
    for datum in batch {
        let mut entry = v1::TimeSeries {
            labels: convert::labels_to_proto(&datum.labels),
            ..Default::default()
        };
        match &datum.value {
            DatumValue::Sample(value) => {
                entry.samples.push(v1::Sample {
                    value: *value,
                    timestamp: datum.timestamp,
                });
                counts.samples += 1;
            }
            DatumValue::Exemplar { value, labels } => {
                entry.exemplars.push(v1::Exemplar {
                    labels: convert::labels_to_proto(labels),
                    value: *value,
                    timestamp: datum.timestamp,
                });
                counts.exemplars += 1;
            }
            DatumValue::Histogram(histogram) => {
                entry
                    .histograms
                    .push(convert::histogram_to_proto(datum.timestamp, histogram));
                counts.histograms += 1;
            }
            DatumValue::FloatHistogram(histogram) => {
                entry.histograms.push(convert::float_histogram_to_proto(
                    datum.timestamp,
                    histogram,
                ));
                counts.histograms += 1;
            }
        }
        series.push(entry);
    }
    (series, counts)
}

fn populate_v2_series(
    batch: &[Datum],
    symbols: &mut SymbolTable,
) -> (Vec<v2::TimeSeries>, BatchCounts) {
    let mut series = Vec::with_capacity(batch.len());
    let mut counts = BatchCounts::default();
    for datum in batch {
        let mut entry = v2::TimeSeries {
            labels_refs: convert::labels_to_refs(&datum.labels, symbols),
            ..Default::default()
        };
        if let Some(metadata) = &datum.metadata {
            entry.metadata = Some(convert::metadata_to_proto(metadata, symbols));
            counts.metadata += 1;
        }
        match &datum.value {
            DatumValue::Sample(value) => {
                entry.samples.push(v2::Sample {
                    value: *value,
                    timestamp: datum.timestamp,
                });
                counts.samples += 1;
            }
            DatumValue::Exemplar { value, labels } => {
                entry.exemplars.push(v2::Exemplar {
                    labels_refs: convert::labels_to_refs(labels, symbols),
                    value: *value,
                    timestamp: datum.timestamp,
                });
                counts.exemplars += 1;
            }
            DatumValue::Histogram(histogram) => {
                entry
                    .histograms
                    .push(convert::histogram_to_proto(datum.timestamp, histogram));
                counts.histograms += 1;
            }
            DatumValue::FloatHistogram(histogram) => {
                entry.histograms.push(convert::float_histogram_to_proto(
                    datum.timestamp,
                    histogram,
                ));
                counts.histograms += 1;
            }
        }
        series.push(entry);
    }
    (series, counts)
}

enum EncodedSeries<'a> {
    V1(&'a mut Vec<v1::TimeSeries>),
    V2 {
        series: &'a mut Vec<v2::TimeSeries>,
        symbols: Vec<String>,
    },
}

/// Builds the request once, then drives it through the retry state machine.
/// Bytes sent and the highest-timestamp watermark move even when the send
/// ultimately fails; only cancellation skips them.
async fn send_encoded_with_backoff(
    context: &QueueContext,
    hard_shutdown: &CancellationToken,
    mut encoded: EncodedSeries<'_>,
    counts: BatchCounts,
    compression: Compression,
    version: WireVersion,
) -> Result<(), StoreError> {
    let built = match &mut encoded {
        EncodedSeries::V1(series) => build_write_request(series, &[], None, compression),
        EncodedSeries::V2 { series, symbols } => {
            build_v2_write_request(series, symbols.clone(), None, compression)
        }
    }
    .context(EncodeSnafu)?;
    context
        .build_request_limit_timestamp
        .store(built.lowest_timestamp, Ordering::Relaxed);
    let highest_timestamp = built.highest_timestamp;

    let mut attempt = RequestAttempt {
        context,
        hard_shutdown,
        payload: Bytes::from(built.payload),
        counts,
        compression,
        version,
        encoded,
    };
    let result = send_with_backoff(
        hard_shutdown,
        context.options.min_backoff,
        context.options.max_backoff,
        &mut attempt,
    )
    .await;
    if matches!(result, Err(StoreError::Cancelled)) {
        return result;
    }

    if result.is_ok() {
        context.metrics.count_sent(&counts);
    }
    context.metrics.add_sent_bytes(attempt.payload.len());
    context.highest_sent.observe(highest_timestamp);
    context.metrics.record_highest_sent(highest_timestamp);
    result
}

struct RequestAttempt<'a> {
    context: &'a QueueContext,
    hard_shutdown: &'a CancellationToken,
    payload: Bytes,
    counts: BatchCounts,
    compression: Compression,
    version: WireVersion,
    encoded: EncodedSeries<'a>,
}

impl RequestAttempt<'_> {
    /// When the oldest entry in the prepared request has aged past the
    /// sample age limit, re-encode with a stale filter so a long retry
    /// storm cannot pin arbitrarily old data in memory.
    fn maybe_refilter(&mut self) -> Result<(), StoreError> {
        let age_limit = self.context.options.sample_age_limit;
        if age_limit.is_zero() {
            return Ok(());
        }
        let min_timestamp = unix_time_ms() - age_limit.as_millis() as i64;
        let lowest = self
            .context
            .build_request_limit_timestamp
            .load(Ordering::Relaxed);
        if lowest >= min_timestamp {
            return Ok(());
        }

        let metrics = &self.context.metrics;
        let built = match &mut self.encoded {
            EncodedSeries::V1(series) => {
                let mut stale = |entry: &v1::TimeSeries| {
                    if let Some(sample) = entry.samples.first() {
                        if sample.timestamp < min_timestamp {
                            metrics.inc_dropped(DatumKind::Sample, DropReason::TooOld);
                            return true;
                        }
                        return false;
                    }
                    if let Some(histogram) = entry.histograms.first() {
                        if histogram.timestamp < min_timestamp {
                            metrics.inc_dropped(DatumKind::Histogram, DropReason::TooOld);
                            return true;
                        }
                        return false;
                    }
                    if let Some(exemplar) = entry.exemplars.first() {
                        if exemplar.timestamp < min_timestamp {
                            metrics.inc_dropped(DatumKind::Exemplar, DropReason::TooOld);
                            return true;
                        }
                    }
                    false
                };
                build_write_request(series, &[], Some(&mut stale), self.compression)
            }
            EncodedSeries::V2 { series, symbols } => {
                let mut stale = |entry: &v2::TimeSeries| {
                    if let Some(sample) = entry.samples.first() {
                        if sample.timestamp < min_timestamp {
                            metrics.inc_dropped(DatumKind::Sample, DropReason::TooOld);
                            return true;
                        }
                        return false;
                    }
                    if let Some(histogram) = entry.histograms.first() {
                        if histogram.timestamp < min_timestamp {
                            metrics.inc_dropped(DatumKind::Histogram, DropReason::TooOld);
                            return true;
                        }
                        return false;
                    }
                    if let Some(exemplar) = entry.exemplars.first() {
                        if exemplar.timestamp < min_timestamp {
                            metrics.inc_dropped(DatumKind::Exemplar, DropReason::TooOld);
                            return true;
                        }
                    }
                    false
                };
                build_v2_write_request(series, symbols.clone(), Some(&mut stale), self.compression)
            }
        }
        .context(EncodeSnafu)?;

        self.context
            .build_request_limit_timestamp
            .store(built.lowest_timestamp, Ordering::Relaxed);
        self.payload = Bytes::from(built.payload);
        Ok(())
    }
}

#[async_trait::async_trait]
impl StoreAttempt for RequestAttempt<'_> {
    async fn attempt(&mut self, try_index: usize) -> Result<(), StoreError> {
        self.maybe_refilter()?;

        let client = self.context.client();
        let span = debug_span!(
            "send_request",
            samples = self.counts.samples as u64,
            attempt = try_index as u64,
            remote_name = client.name(),
            remote_url = client.endpoint(),
        );
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = self.hard_shutdown.cancelled() => Err(StoreError::Cancelled),
            result = client
                .store(self.payload.clone(), try_index, self.version, self.compression)
                .instrument(span) => result,
        };
        self.context
            .metrics
            .observe_send_duration(started.elapsed().as_secs_f64());
        result
    }

    fn on_retry(&mut self) {
        self.context.metrics.count_retried(&self.counts);
    }
}

#[cfg(test)]
mod tests {
    use courier_model::{Labels, Metadata, MetricType};

    use super::*;

    fn sample_datum(name: &str, timestamp: i64, with_metadata: bool) -> Datum {
        Datum {
            labels: Labels::from_pairs([("__name__", name)]),
            metadata: with_metadata.then(|| Metadata {
                metric_type: MetricType::Gauge,
                unit: String::new(),
                help: "a gauge".to_owned(),
            }),
            timestamp,
            value: DatumValue::Sample(1.0),
        }
    }

    #[test]
    fn v1_population_counts_kinds() {
        let batch = vec![
            sample_datum("a", 1, false),
            Datum {
                labels: Labels::from_pairs([("__name__", "b")]),
                metadata: None,
                timestamp: 2,
                value: DatumValue::Exemplar {
                    value: 0.5,
                    labels: Labels::from_pairs([("trace_id", "abc")]),
                },
            },
        ];
        let (series, counts) = populate_v1_series(&batch);
        assert_eq!(series.len(), 2);
        assert_eq!(counts.samples, 1);
        assert_eq!(counts.exemplars, 1);
        assert_eq!(counts.histograms, 0);
        assert_eq!(series[0].samples.len(), 1);
        assert_eq!(series[1].exemplars[0].labels[0].value, "abc");
    }

    #[test]
    fn v2_population_carries_inline_metadata() {
        let batch = vec![sample_datum("a", 1, true), sample_datum("b", 2, false)];
        let mut symbols = SymbolTable::new();
        let (series, counts) = populate_v2_series(&batch, &mut symbols);
        assert_eq!(counts.samples, 2);
        assert_eq!(counts.metadata, 1);
        assert!(series[0].metadata.is_some());
        assert!(series[1].metadata.is_none());
        // Label names are shared through the symbol table.
        assert_eq!(series[0].labels_refs[0], series[1].labels_refs[0]);
    }
}
