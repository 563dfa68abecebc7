use std::time::Duration;

use courier_wire::WireVersion;

/// Tunables for one remote-write queue.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Total number of buffered items per shard, across the partial batch
    /// and the published-batch channel.
    pub capacity: usize,
    /// Batch size for one outgoing request. When exemplar shipping is on,
    /// batches get 10% headroom on top of this.
    pub max_samples_per_send: usize,
    /// How long a partial batch may sit before it is flushed anyway.
    pub batch_send_deadline: Duration,
    pub min_shards: usize,
    pub max_shards: usize,
    /// Retry backoff bounds for failed sends.
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// Samples older than this are dropped instead of shipped; zero
    /// disables age filtering.
    pub sample_age_limit: Duration,
    /// How long `stop` waits for shards to drain before aborting them.
    pub flush_deadline: Duration,
    pub wire_format: WireVersion,
    pub send_exemplars: bool,
    pub send_native_histograms: bool,
    pub metadata: MetadataOptions,
}

/// Options for the legacy v1 metadata path, where metric-family metadata is
/// shipped in dedicated requests instead of inline with each series.
#[derive(Debug, Clone)]
pub struct MetadataOptions {
    pub send: bool,
    pub send_interval: Duration,
    pub max_samples_per_send: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            max_samples_per_send: 2_000,
            batch_send_deadline: Duration::from_secs(5),
            min_shards: 1,
            max_shards: 50,
            min_backoff: Duration::from_millis(30),
            max_backoff: Duration::from_secs(5),
            sample_age_limit: Duration::ZERO,
            flush_deadline: Duration::from_secs(60),
            wire_format: WireVersion::V1,
            send_exemplars: false,
            send_native_histograms: false,
            metadata: MetadataOptions::default(),
        }
    }
}

impl Default for MetadataOptions {
    fn default() -> Self {
        Self {
            send: true,
            send_interval: Duration::from_secs(60),
            max_samples_per_send: 500,
        }
    }
}

impl QueueOptions {
    /// Effective per-batch capacity, including the exemplar headroom.
    pub(crate) fn batch_size(&self) -> usize {
        if self.send_exemplars {
            self.max_samples_per_send + self.max_samples_per_send / 10
        } else {
            self.max_samples_per_send
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exemplar_headroom_bumps_batch_size() {
        let mut options = QueueOptions::default();
        assert_eq!(options.batch_size(), 2_000);
        options.send_exemplars = true;
        assert_eq!(options.batch_size(), 2_200);
    }
}
