#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use courier_model::{Labels, NoopInterner, SampleRecord, SeriesRecord, SeriesRef};
use courier_queue::{QueueManager, QueueOptions, StoreError, WriteClient};
use courier_wire::{Compression, WireVersion, decompress_payload, v1, v2};
use prost::Message;

/// One request the mock endpoint received, decoded back into protobuf.
#[derive(Clone)]
pub struct CapturedRequest {
    pub version: WireVersion,
    pub attempt: usize,
    pub v1: Option<v1::WriteRequest>,
    pub v2: Option<v2::WriteRequest>,
    pub received_at: tokio::time::Instant,
}

/// A scriptable endpoint: responses are served from a queue (then Ok, or
/// always a recoverable error when `fail_by_default` is set), and the
/// advertised protocol header can change between requests.
#[derive(Default)]
pub struct MockWriteClient {
    requests: Mutex<Vec<CapturedRequest>>,
    responses: Mutex<VecDeque<Result<(), StoreError>>>,
    header: Mutex<Option<String>>,
    header_after_response: Mutex<VecDeque<String>>,
    fail_by_default: AtomicBool,
}

impl MockWriteClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_header(header: &str) -> Arc<Self> {
        let client = Self::default();
        *client.header.lock().unwrap() = Some(header.to_owned());
        Arc::new(client)
    }

    pub fn set_header(&self, header: &str) {
        *self.header.lock().unwrap() = Some(header.to_owned());
    }

    /// Advertise `header` starting with the response to the next request.
    pub fn set_header_after_next_response(&self, header: &str) {
        self.header_after_response
            .lock()
            .unwrap()
            .push_back(header.to_owned());
    }

    pub fn push_responses(&self, responses: impl IntoIterator<Item = Result<(), StoreError>>) {
        self.responses.lock().unwrap().extend(responses);
    }

    /// Once the scripted responses run out, keep failing recoverably
    /// instead of succeeding.
    pub fn fail_by_default(&self) {
        self.fail_by_default.store(true, Ordering::Relaxed);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl WriteClient for MockWriteClient {
    async fn store(
        &self,
        payload: Bytes,
        attempt: usize,
        version: WireVersion,
        _compression: Compression,
    ) -> Result<(), StoreError> {
        let raw = decompress_payload(&payload, Compression::Snappy).expect("decompress request");
        let mut captured = CapturedRequest {
            version,
            attempt,
            v1: None,
            v2: None,
            received_at: tokio::time::Instant::now(),
        };
        match version {
            WireVersion::V1 => {
                captured.v1 =
                    Some(v1::WriteRequest::decode(raw.as_slice()).expect("decode v1 request"));
            }
            WireVersion::V2 => {
                captured.v2 =
                    Some(v2::WriteRequest::decode(raw.as_slice()).expect("decode v2 request"));
            }
        }
        self.requests.lock().unwrap().push(captured);

        if let Some(header) = self.header_after_response.lock().unwrap().pop_front() {
            *self.header.lock().unwrap() = Some(header);
        }

        if let Some(response) = self.responses.lock().unwrap().pop_front() {
            return response;
        }
        if self.fail_by_default.load(Ordering::Relaxed) {
            return Err(StoreError::Recoverable {
                message: "mock endpoint failing".to_owned(),
                retry_after: None,
            });
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn endpoint(&self) -> &str {
        "http://mock.invalid/api/v1/write"
    }

    fn last_response_header(&self) -> Option<String> {
        self.header.lock().unwrap().clone()
    }

    async fn probe_versions(&self) {}
}

pub fn recoverable(retry_after: Option<Duration>) -> Result<(), StoreError> {
    Err(StoreError::Recoverable {
        message: "scripted failure".to_owned(),
        retry_after,
    })
}

pub fn renegotiate(status: u16) -> Result<(), StoreError> {
    Err(StoreError::Renegotiate { status })
}

/// Small batches, a single shard, and quick backoffs; individual tests
/// override what they exercise.
pub fn test_options() -> QueueOptions {
    QueueOptions {
        capacity: 50,
        max_samples_per_send: 5,
        batch_send_deadline: Duration::from_millis(100),
        min_shards: 1,
        max_shards: 1,
        min_backoff: Duration::from_millis(30),
        max_backoff: Duration::from_millis(100),
        flush_deadline: Duration::from_secs(5),
        ..QueueOptions::default()
    }
}

pub fn new_manager(options: QueueOptions, client: Arc<MockWriteClient>) -> Arc<QueueManager> {
    QueueManager::new(
        options,
        Labels::default(),
        Vec::new(),
        client,
        Arc::new(NoopInterner),
    )
}

/// Registers `count` series named `metric_<i>` under refs `0..count`.
pub fn seed_series(manager: &QueueManager, count: u64) {
    let records: Vec<SeriesRecord> = (0..count)
        .map(|id| SeriesRecord {
            series: SeriesRef(id),
            labels: Labels::from_pairs([("__name__", format!("metric_{id}"))]),
        })
        .collect();
    manager.store_series(&records, 0);
}

pub fn sample(series: u64, timestamp: i64, value: f64) -> SampleRecord {
    SampleRecord {
        series: SeriesRef(series),
        timestamp,
        value,
    }
}

/// Polls `condition` until it holds or the deadline passes.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Duration::from_secs(10);
    let started = tokio::time::Instant::now();
    while !condition() {
        assert!(
            started.elapsed() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Metric name of a v1 series entry.
pub fn v1_name(entry: &v1::TimeSeries) -> &str {
    entry
        .labels
        .iter()
        .find(|label| label.name == "__name__")
        .map(|label| label.value.as_str())
        .unwrap_or_default()
}
