//! The queue manager: ingress entry points fed by the log reader, the
//! series index, the shard controller, and the lifecycle around the shard
//! pool.

use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use courier_model::{
    ExemplarRecord, FamilyMetadata, FloatHistogramRecord, HistogramRecord, Interner, Labels,
    Metadata, MetadataRecord, SampleRecord, SeriesRecord, SeriesRef,
    relabel::RelabelRule,
};
use courier_wire::{Compression, WireVersion, build_write_request, convert, negotiate, v1};
use snafu::ResultExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, error, info, warn};

use crate::client::{EncodeSnafu, StoreError, WriteClient};
use crate::config::QueueOptions;
use crate::ewma::EwmaRate;
use crate::metrics::{DropReason, QueueMetrics};
use crate::retry::{StoreAttempt, send_with_backoff};
use crate::series::{SeriesIndex, SeriesLookup};
use crate::shards::Shards;
use crate::types::{Datum, DatumKind, DatumValue, QueueContext, unix_time_ms, unix_time_seconds};

// Samples in/out and send durations are smoothed with an exponentially
// weighted moving average on a fixed cadence.
const EWMA_WEIGHT: f64 = 0.2;
const SHARD_UPDATE_INTERVAL: Duration = Duration::from_secs(10);

// Allow 30% too many shards before scaling down.
const SHARD_TOLERANCE: f64 = 0.3;

// Never scale down while the send watermark lags receive by more than this.
const MAX_LAG_FOR_DOWNSCALE_SECONDS: f64 = 10.0;

// Enqueue retries start well below the configured send backoff: a full
// shard clears as soon as a batch slot frees up, not on endpoint timescales.
const ENQUEUE_RETRY_START: Duration = Duration::from_millis(5);

/// The ingress interface driven by the external log reader. Append methods
/// return `false` once shutdown has been observed, telling the reader to
/// stop.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn append_samples(&self, samples: &[SampleRecord]) -> bool;
    async fn append_exemplars(&self, exemplars: &[ExemplarRecord]) -> bool;
    async fn append_histograms(&self, histograms: &[HistogramRecord]) -> bool;
    async fn append_float_histograms(&self, histograms: &[FloatHistogramRecord]) -> bool;
    fn store_series(&self, series: &[SeriesRecord], segment: u32);
    fn store_metadata(&self, metadata: &[MetadataRecord]);
    fn update_series_segment(&self, series: &[SeriesRecord], segment: u32);
    fn checkpoint_reached(&self, segment: u32);
}

/// Manages one queue of samples bound for one remote endpoint: looks up
/// series labels for incoming refs, routes data across the shard pool, and
/// rescales the pool from observed rates.
pub struct QueueManager {
    context: Arc<QueueContext>,
    series: SeriesIndex,
    shards: Arc<Shards>,
    num_shards: AtomicUsize,
    reshard_tx: mpsc::Sender<usize>,
    reshard_rx: parking_lot::Mutex<Option<mpsc::Receiver<usize>>>,
    quit: CancellationToken,
    background: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

enum AppendOutcome {
    Continue,
    Shutdown,
}

impl QueueManager {
    pub fn new(
        mut options: QueueOptions,
        external_labels: Labels,
        relabel_rules: Vec<RelabelRule>,
        client: Arc<dyn WriteClient>,
        interner: Arc<dyn Interner>,
    ) -> Arc<Self> {
        // The scrape-time metadata path and inline v2 metadata are mutually
        // exclusive; v2 wins because it ships metadata with every series.
        if options.metadata.send && options.wire_format == WireVersion::V2 {
            warn!(
                "metadata.send is redundant with the v2 wire format; metadata is taken from the log and shipped inline"
            );
            options.metadata.send = false;
        }

        let keep_metadata = options.wire_format == WireVersion::V2;
        let num_shards = options.min_shards;
        let rates = [
            EwmaRate::new(EWMA_WEIGHT, SHARD_UPDATE_INTERVAL),
            EwmaRate::new(EWMA_WEIGHT, SHARD_UPDATE_INTERVAL),
            EwmaRate::new(EWMA_WEIGHT, SHARD_UPDATE_INTERVAL),
            EwmaRate::new(EWMA_WEIGHT, SHARD_UPDATE_INTERVAL),
        ];
        let context = Arc::new(QueueContext::new(options, client, rates));
        let series = SeriesIndex::new(
            external_labels.into_iter().collect(),
            relabel_rules,
            interner,
            keep_metadata,
        );
        let shards = Arc::new(Shards::new(Arc::clone(&context)));
        let (reshard_tx, reshard_rx) = mpsc::channel(1);

        Arc::new(Self {
            context,
            series,
            shards,
            num_shards: AtomicUsize::new(num_shards),
            reshard_tx,
            reshard_rx: parking_lot::Mutex::new(Some(reshard_rx)),
            quit: CancellationToken::new(),
            background: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Starts the shard pool, the shard controller, and the reshard
    /// serializer. The log reader can append as soon as this returns.
    pub async fn start(self: &Arc<Self>) {
        let options = &self.context.options;
        let metrics = &self.context.metrics;
        metrics.record_batch_settings(options.capacity, options.max_samples_per_send);
        metrics.record_shard_limits(options.min_shards, options.max_shards);
        metrics.record_desired_shards(options.min_shards as f64);

        // Prime content negotiation before the first batch goes out.
        self.context.client().probe_versions().await;

        self.shards
            .start(self.num_shards.load(Ordering::Relaxed))
            .await;

        let mut background = self.background.lock();
        background.push(tokio::spawn(Arc::clone(self).update_shards_loop()));
        if let Some(requests) = self.reshard_rx.lock().take() {
            background.push(tokio::spawn(Arc::clone(self).reshard_loop(requests)));
        }
    }

    /// Stops accepting data and drains the shard pool, waiting up to the
    /// flush deadline before aborting in-flight sends.
    pub async fn stop(&self) {
        info!("stopping remote-write queue");
        self.quit.cancel();
        let background: Vec<_> = mem::take(&mut *self.background.lock());
        for task in background {
            let _ = task.await;
        }
        // Loops are down, so no reshard can race the final shards.stop.
        self.shards.stop().await;
        self.series.release_all();
        info!("remote-write queue stopped");
    }

    /// Swaps the write client without restarting the queue. Used when only
    /// transport-level settings changed.
    pub fn set_client(&self, client: Arc<dyn WriteClient>) {
        self.context.swap_client(client);
    }

    pub fn metrics(&self) -> &QueueMetrics {
        &self.context.metrics
    }

    /// Number of currently running shards.
    pub async fn shard_count(&self) -> usize {
        self.shards.len().await
    }

    pub async fn append_samples(&self, samples: &[SampleRecord]) -> bool {
        for sample in samples {
            let outcome = self
                .append_one(
                    sample.series,
                    sample.timestamp,
                    DatumKind::Sample,
                    ENQUEUE_RETRY_START,
                    |labels, metadata| Datum {
                        labels,
                        metadata,
                        timestamp: sample.timestamp,
                        value: DatumValue::Sample(sample.value),
                    },
                )
                .await;
            if matches!(outcome, AppendOutcome::Shutdown) {
                return false;
            }
        }
        true
    }

    pub async fn append_exemplars(&self, exemplars: &[ExemplarRecord]) -> bool {
        if !self.context.options.send_exemplars {
            return true;
        }
        // Exemplars only ever wait on resharding, so their retry can start
        // at the configured backoff floor.
        let initial_backoff = self.context.options.min_backoff;
        for exemplar in exemplars {
            let outcome = self
                .append_one(
                    exemplar.series,
                    exemplar.timestamp,
                    DatumKind::Exemplar,
                    initial_backoff,
                    |labels, metadata| Datum {
                        labels,
                        metadata,
                        timestamp: exemplar.timestamp,
                        value: DatumValue::Exemplar {
                            value: exemplar.value,
                            labels: exemplar.labels.clone(),
                        },
                    },
                )
                .await;
            if matches!(outcome, AppendOutcome::Shutdown) {
                return false;
            }
        }
        true
    }

    pub async fn append_histograms(&self, histograms: &[HistogramRecord]) -> bool {
        if !self.context.options.send_native_histograms {
            return true;
        }
        for histogram in histograms {
            let outcome = self
                .append_one(
                    histogram.series,
                    histogram.timestamp,
                    DatumKind::Histogram,
                    ENQUEUE_RETRY_START,
                    |labels, metadata| Datum {
                        labels,
                        metadata,
                        timestamp: histogram.timestamp,
                        value: DatumValue::Histogram(histogram.histogram.clone()),
                    },
                )
                .await;
            if matches!(outcome, AppendOutcome::Shutdown) {
                return false;
            }
        }
        true
    }

    pub async fn append_float_histograms(&self, histograms: &[FloatHistogramRecord]) -> bool {
        if !self.context.options.send_native_histograms {
            return true;
        }
        for histogram in histograms {
            let outcome = self
                .append_one(
                    histogram.series,
                    histogram.timestamp,
                    DatumKind::FloatHistogram,
                    ENQUEUE_RETRY_START,
                    |labels, metadata| Datum {
                        labels,
                        metadata,
                        timestamp: histogram.timestamp,
                        value: DatumValue::FloatHistogram(histogram.histogram.clone()),
                    },
                )
                .await;
            if matches!(outcome, AppendOutcome::Shutdown) {
                return false;
            }
        }
        true
    }

    /// The shared per-item ingress path: age filter, label lookup, then
    /// enqueue with exponential retry until the pool takes it or shutdown
    /// is observed.
    async fn append_one(
        &self,
        series_ref: SeriesRef,
        timestamp: i64,
        kind: DatumKind,
        initial_backoff: Duration,
        make_datum: impl FnOnce(Labels, Option<Metadata>) -> Datum,
    ) -> AppendOutcome {
        let context = &self.context;
        context.data_in.incr(1);
        context.highest_recv.observe(timestamp);

        if self.sample_is_too_old(timestamp) {
            context.metrics.inc_dropped(kind, DropReason::TooOld);
            return AppendOutcome::Continue;
        }

        let (labels, metadata) = match self.series.lookup(series_ref) {
            SeriesLookup::Found { labels, metadata } => (labels, metadata),
            SeriesLookup::DroppedByRelabel => {
                context.data_dropped.incr(1);
                context.metrics.inc_dropped(kind, DropReason::DroppedSeries);
                return AppendOutcome::Continue;
            }
            SeriesLookup::Unknown { first_sighting } => {
                context.data_dropped.incr(1);
                if first_sighting {
                    info!(
                        series = %series_ref,
                        kind = ?kind,
                        "dropped item for series that was not explicitly dropped via relabelling"
                    );
                }
                context
                    .metrics
                    .inc_dropped(kind, DropReason::UnintentionalDroppedSeries);
                return AppendOutcome::Continue;
            }
        };

        let mut datum = make_datum(labels, metadata);
        let mut backoff = initial_backoff;
        loop {
            if self.quit.is_cancelled() {
                return AppendOutcome::Shutdown;
            }
            match self.shards.enqueue(series_ref, datum).await {
                Ok(()) => return AppendOutcome::Continue,
                Err(rejected) => {
                    datum = rejected;
                    context.metrics.inc_enqueue_retries();
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(context.options.max_backoff);
                }
            }
        }
    }

    pub fn store_series(&self, series: &[SeriesRecord], segment: u32) {
        self.series.store_series(series, segment);
    }

    pub fn store_metadata(&self, metadata: &[MetadataRecord]) {
        self.series.store_metadata(metadata);
    }

    pub fn update_series_segment(&self, series: &[SeriesRecord], segment: u32) {
        self.series.update_segment(series, segment);
    }

    /// The log checkpointed through `segment`: forget every ref last seen
    /// before it.
    pub fn checkpoint_reached(&self, segment: u32) {
        self.series.checkpoint(segment);
    }

    /// Ships scrape-time metric-family metadata in dedicated requests.
    /// No-op on the v2 wire format, where metadata travels inline.
    pub async fn append_metadata(&self, entries: &[FamilyMetadata]) {
        if self.context.options.wire_format == WireVersion::V2 || entries.is_empty() {
            return;
        }
        let proto: Vec<v1::MetricMetadata> = entries
            .iter()
            .map(|entry| v1::MetricMetadata {
                metric_type: convert::metric_type_to_proto(entry.metric_type) as i32,
                metric_family_name: entry.metric_family_name.clone(),
                help: entry.help.clone(),
                unit: entry.unit.clone(),
            })
            .collect();
        let (compression, _) = negotiate(
            self.context.options.wire_format,
            self.context.client().last_response_header().as_deref(),
        );

        for chunk in proto.chunks(self.context.options.metadata.max_samples_per_send) {
            if let Err(error) = self.send_metadata_with_backoff(chunk, compression).await {
                self.context.metrics.inc_failed_metadata(chunk.len());
                error!(
                    error = %error,
                    count = chunk.len() as u64,
                    "non-recoverable error while sending metadata"
                );
            }
        }
    }

    async fn send_metadata_with_backoff(
        &self,
        chunk: &[v1::MetricMetadata],
        compression: Compression,
    ) -> Result<(), StoreError> {
        let mut no_series = Vec::new();
        let built =
            build_write_request(&mut no_series, chunk, None, compression).context(EncodeSnafu)?;
        let payload = Bytes::from(built.payload);
        let payload_size = payload.len();

        let mut attempt = MetadataAttempt {
            context: &self.context,
            quit: &self.quit,
            payload,
            compression,
            count: chunk.len(),
        };
        send_with_backoff(
            &self.quit,
            self.context.options.min_backoff,
            self.context.options.max_backoff,
            &mut attempt,
        )
        .await?;

        self.context.metrics.inc_sent_metadata(chunk.len());
        self.context.metrics.add_metadata_bytes(payload_size);
        Ok(())
    }

    fn sample_is_too_old(&self, timestamp: i64) -> bool {
        let limit = self.context.options.sample_age_limit;
        if limit.is_zero() {
            return false;
        }
        timestamp < unix_time_ms() - limit.as_millis() as i64
    }

    /// Recomputes the desired shard count every tick and hands accepted
    /// changes to the reshard serializer without blocking the cadence.
    async fn update_shards_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(SHARD_UPDATE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.context.data_in.tick();
                    let desired = self.calculate_desired_shards();
                    if !self.should_reshard(desired) {
                        continue;
                    }
                    let current = self.num_shards.load(Ordering::Relaxed);
                    match self.reshard_tx.try_send(desired) {
                        Ok(()) => {
                            info!(from = current as u64, to = desired as u64, "resharding remote-write queue");
                            self.num_shards.store(desired, Ordering::Relaxed);
                        }
                        Err(_) => info!("currently resharding, skipping"),
                    }
                }
                _ = self.quit.cancelled() => return,
            }
        }
    }

    /// Applies reshard requests one at a time. The old pool is fully
    /// drained and stopped before the new one starts, so per-series order
    /// is preserved across the swap.
    async fn reshard_loop(self: Arc<Self>, mut requests: mpsc::Receiver<usize>) {
        loop {
            tokio::select! {
                request = requests.recv() => {
                    let Some(shard_count) = request else { return };
                    self.shards.stop().await;
                    self.shards.start(shard_count).await;
                }
                _ = self.quit.cancelled() => return,
            }
        }
    }

    /// The controller maths: predict next interval's work from the
    /// incoming rate, add a 5%-per-second catch-up for the backlog, and
    /// size shards by the observed cost of shipping one sample.
    fn calculate_desired_shards(&self) -> usize {
        let context = &self.context;
        context.data_out.tick();
        context.data_dropped.tick();
        context.data_out_duration.tick();

        let current = self.num_shards.load(Ordering::Relaxed);
        let data_in_rate = context.data_in.rate();
        let data_out_rate = context.data_out.rate();
        let data_kept_ratio = data_out_rate / (context.data_dropped.rate() + data_out_rate);
        let data_out_duration = context.data_out_duration.rate() / 1e9;
        let highest_sent = context.highest_sent.get() as f64 / 1_000.0;
        let highest_recv = context.highest_recv.get() as f64 / 1_000.0;
        let delay = highest_recv - highest_sent;
        let data_pending = delay * data_in_rate * data_kept_ratio;

        if data_out_rate <= 0.0 {
            return current;
        }

        let backlog_catchup = 0.05 * data_pending;
        let time_per_sample = data_out_duration / data_out_rate;
        let desired = time_per_sample * (data_in_rate * data_kept_ratio + backlog_catchup);
        context.metrics.record_desired_shards(desired);
        debug!(
            data_in_rate,
            data_out_rate,
            data_kept_ratio,
            data_pending,
            data_out_duration,
            time_per_sample,
            desired,
            highest_sent,
            highest_recv,
            "computed desired shards"
        );

        let lower = current as f64 * (1.0 - SHARD_TOLERANCE);
        let upper = current as f64 * (1.0 + SHARD_TOLERANCE);
        let desired = desired.ceil();
        if lower <= desired && desired <= upper {
            return current;
        }

        let desired = desired as i64;
        if (desired as usize) < current && delay > MAX_LAG_FOR_DOWNSCALE_SECONDS {
            debug!(delay, "not downscaling, too far behind");
            return current;
        }
        desired.clamp(
            self.context.options.min_shards as i64,
            self.context.options.max_shards as i64,
        ) as usize
    }

    /// A reshard is worthwhile only when the count changed and the
    /// endpoint has completed a send recently; churning a broken endpoint
    /// helps nothing.
    fn should_reshard(&self, desired: usize) -> bool {
        if desired == self.num_shards.load(Ordering::Relaxed) {
            return false;
        }
        let threshold = unix_time_seconds()
            - 2 * self.context.options.batch_send_deadline.as_secs() as i64;
        let last_send = self.context.last_send_timestamp.load(Ordering::Relaxed);
        if last_send < threshold {
            warn!(
                last_send,
                threshold, "skipping resharding, last send was beyond threshold"
            );
            return false;
        }
        true
    }
}

#[async_trait]
impl LogSink for QueueManager {
    async fn append_samples(&self, samples: &[SampleRecord]) -> bool {
        QueueManager::append_samples(self, samples).await
    }

    async fn append_exemplars(&self, exemplars: &[ExemplarRecord]) -> bool {
        QueueManager::append_exemplars(self, exemplars).await
    }

    async fn append_histograms(&self, histograms: &[HistogramRecord]) -> bool {
        QueueManager::append_histograms(self, histograms).await
    }

    async fn append_float_histograms(&self, histograms: &[FloatHistogramRecord]) -> bool {
        QueueManager::append_float_histograms(self, histograms).await
    }

    fn store_series(&self, series: &[SeriesRecord], segment: u32) {
        QueueManager::store_series(self, series, segment);
    }

    fn store_metadata(&self, metadata: &[MetadataRecord]) {
        QueueManager::store_metadata(self, metadata);
    }

    fn update_series_segment(&self, series: &[SeriesRecord], segment: u32) {
        QueueManager::update_series_segment(self, series, segment);
    }

    fn checkpoint_reached(&self, segment: u32) {
        QueueManager::checkpoint_reached(self, segment);
    }
}

struct MetadataAttempt<'a> {
    context: &'a QueueContext,
    quit: &'a CancellationToken,
    payload: Bytes,
    compression: Compression,
    count: usize,
}

#[async_trait]
impl StoreAttempt for MetadataAttempt<'_> {
    async fn attempt(&mut self, try_index: usize) -> Result<(), StoreError> {
        let client = self.context.client();
        let span = debug_span!(
            "send_metadata",
            count = self.count as u64,
            attempt = try_index as u64,
            remote_name = client.name(),
            remote_url = client.endpoint(),
        );
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = self.quit.cancelled() => Err(StoreError::Cancelled),
            result = client
                .store(self.payload.clone(), try_index, WireVersion::V1, self.compression)
                .instrument(span) => result,
        };
        self.context
            .metrics
            .observe_send_duration(started.elapsed().as_secs_f64());
        result
    }

    fn on_retry(&mut self) {
        self.context.metrics.inc_retried_metadata(self.count);
    }
}

#[cfg(test)]
mod tests {
    use courier_model::NoopInterner;

    use super::*;

    struct NullClient;

    #[async_trait]
    impl WriteClient for NullClient {
        async fn store(
            &self,
            _payload: Bytes,
            _attempt: usize,
            _version: WireVersion,
            _compression: Compression,
        ) -> Result<(), StoreError> {
            Ok(())
        }

        fn name(&self) -> &str {
            "null"
        }

        fn endpoint(&self) -> &str {
            "http://localhost/api/v1/write"
        }

        fn last_response_header(&self) -> Option<String> {
            None
        }

        async fn probe_versions(&self) {}
    }

    fn manager_with(min_shards: usize, max_shards: usize) -> Arc<QueueManager> {
        let options = QueueOptions {
            min_shards,
            max_shards,
            ..QueueOptions::default()
        };
        QueueManager::new(
            options,
            Labels::default(),
            Vec::new(),
            Arc::new(NullClient),
            Arc::new(NoopInterner),
        )
    }

    /// Drives the rate trackers to a steady state where shipping one
    /// sample costs `seconds_per_sample` and `rate` samples/s flow both in
    /// and out.
    fn feed_rates(manager: &QueueManager, rate: i64, seconds_per_sample: f64) {
        let context = &manager.context;
        let interval = SHARD_UPDATE_INTERVAL.as_secs() as i64;
        context.data_in.incr(rate * interval);
        context.data_in.tick();
        context.data_out.incr(rate * interval);
        context
            .data_out_duration
            .incr((rate as f64 * interval as f64 * seconds_per_sample * 1e9) as i64);
    }

    #[test]
    fn keeps_current_shards_when_nothing_was_sent() {
        let manager = manager_with(1, 16);
        manager.num_shards.store(3, Ordering::Relaxed);
        manager.context.data_in.incr(1_000);
        manager.context.data_in.tick();
        assert_eq!(manager.calculate_desired_shards(), 3);
    }

    #[test]
    fn scales_up_when_sending_is_slow() {
        let manager = manager_with(1, 16);
        manager.num_shards.store(2, Ordering::Relaxed);
        // 100 samples/s, 80ms each: eight shards' worth of work.
        feed_rates(&manager, 100, 0.08);
        assert_eq!(manager.calculate_desired_shards(), 8);
    }

    #[test]
    fn desired_shards_respect_the_maximum() {
        let manager = manager_with(1, 4);
        manager.num_shards.store(2, Ordering::Relaxed);
        feed_rates(&manager, 100, 0.08);
        assert_eq!(manager.calculate_desired_shards(), 4);
    }

    #[test]
    fn small_changes_stay_inside_the_tolerance_band() {
        let manager = manager_with(1, 16);
        manager.num_shards.store(8, Ordering::Relaxed);
        // Desired comes out at 8: no change; and anything within 30% of 8
        // would equally be ignored.
        feed_rates(&manager, 100, 0.08);
        assert_eq!(manager.calculate_desired_shards(), 8);
    }

    #[test]
    fn never_downscales_while_lagging() {
        let manager = manager_with(1, 16);
        manager.num_shards.store(8, Ordering::Relaxed);
        // Cheap sends would suggest two shards, but the send watermark is
        // 20s behind what was received.
        feed_rates(&manager, 100, 0.02);
        manager.context.highest_recv.observe(20_000);
        assert_eq!(manager.calculate_desired_shards(), 8);
    }

    #[test]
    fn resharding_requires_a_recent_send() {
        let manager = manager_with(1, 16);
        manager.num_shards.store(2, Ordering::Relaxed);
        // Never sent anything: gate closed.
        assert!(!manager.should_reshard(8));

        manager
            .context
            .last_send_timestamp
            .store(unix_time_seconds(), Ordering::Relaxed);
        assert!(manager.should_reshard(8));
        assert!(!manager.should_reshard(2));
    }
}
