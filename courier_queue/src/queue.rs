//! The per-shard buffer: one partial batch plus a bounded channel of full
//! batches, with a small pool so batch allocations are reused.

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio_util::sync::CancellationToken;

use crate::types::Datum;

const FLUSH_RETRY_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) struct ShardQueue {
    batch_capacity: usize,
    inner: Mutex<QueueInner>,
    pool: Mutex<Vec<Vec<Datum>>>,
    pool_limit: usize,
}

struct QueueInner {
    batch: Vec<Datum>,
    /// `None` once the queue has been closed; appends then fail.
    publish: Option<mpsc::Sender<Vec<Datum>>>,
}

impl ShardQueue {
    /// `slots` bounds how many full batches may sit unpicked in the
    /// channel; the partial batch acts as one more.
    pub fn new(batch_capacity: usize, slots: usize) -> (Arc<Self>, mpsc::Receiver<Vec<Datum>>) {
        let slots = slots.max(1);
        let (tx, rx) = mpsc::channel(slots);
        let queue = Arc::new(Self {
            batch_capacity,
            inner: Mutex::new(QueueInner {
                batch: Vec::with_capacity(batch_capacity),
                publish: Some(tx),
            }),
            pool: Mutex::new(Vec::new()),
            pool_limit: slots + 1,
        });
        (queue, rx)
    }

    /// Appends one datum. When this fills the batch, the batch is published
    /// to the channel; if the channel is full the datum is rolled back and
    /// handed back to the caller to retry later. A failed publish never
    /// loses data.
    pub fn append(&self, datum: Datum) -> Result<(), Datum> {
        let mut inner = self.inner.lock();
        let Some(publish) = inner.publish.clone() else {
            return Err(datum);
        };
        inner.batch.push(datum);
        if inner.batch.len() == self.batch_capacity {
            let batch = mem::take(&mut inner.batch);
            match publish.try_send(batch) {
                Ok(()) => inner.batch = self.batch_from_pool(),
                Err(TrySendError::Full(mut batch)) | Err(TrySendError::Closed(mut batch)) => {
                    let datum = batch.pop().expect("batch was filled above");
                    inner.batch = batch;
                    return Err(datum);
                }
            }
        }
        Ok(())
    }

    /// Takes the partial batch, leaving an empty one behind. Callers that
    /// want strict ordering must drain the channel first.
    pub fn take_current(&self) -> Vec<Datum> {
        let replacement = self.batch_from_pool();
        let mut inner = self.inner.lock();
        mem::replace(&mut inner.batch, replacement)
    }

    /// Hands a drained batch back for reuse. The pool is bounded by the
    /// channel capacity plus the one batch in flight.
    pub fn return_for_reuse(&self, mut batch: Vec<Datum>) {
        batch.clear();
        let mut pool = self.pool.lock();
        if pool.len() < self.pool_limit {
            pool.push(batch);
        }
    }

    /// Publishes any remaining partial batch, retrying every second until
    /// the channel has room or `hard_shutdown` fires, then closes the
    /// channel so the worker drains and exits.
    pub async fn flush_and_close(&self, hard_shutdown: CancellationToken) {
        while self.try_publish_current() {
            tokio::select! {
                _ = tokio::time::sleep(FLUSH_RETRY_INTERVAL) => {}
                _ = hard_shutdown.cancelled() => break,
            }
        }
        let mut inner = self.inner.lock();
        inner.batch = Vec::new();
        inner.publish = None;
    }

    /// Returns true when there is still a non-empty partial batch that the
    /// channel had no room for.
    fn try_publish_current(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.batch.is_empty() {
            return false;
        }
        let Some(publish) = inner.publish.clone() else {
            return false;
        };
        let batch = mem::take(&mut inner.batch);
        match publish.try_send(batch) {
            Ok(()) => false,
            Err(TrySendError::Closed(_)) => false,
            Err(TrySendError::Full(batch)) => {
                inner.batch = batch;
                true
            }
        }
    }

    fn batch_from_pool(&self) -> Vec<Datum> {
        self.pool
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.batch_capacity))
    }
}

/// Receives the next full batch without waiting, falling back to the
/// partial batch. Used on the deadline-timer path, where channel content
/// must win to keep per-series order.
pub(crate) fn next_batch_now(rx: &mut mpsc::Receiver<Vec<Datum>>, queue: &ShardQueue) -> Vec<Datum> {
    match rx.try_recv() {
        Ok(batch) => batch,
        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => queue.take_current(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_model::Labels;

    use crate::types::DatumValue;

    fn datum(value: f64) -> Datum {
        Datum {
            labels: Labels::from_pairs([("__name__", "up")]),
            metadata: None,
            timestamp: 0,
            value: DatumValue::Sample(value),
        }
    }

    #[tokio::test]
    async fn fills_publish_batches_of_batch_capacity() {
        let (queue, mut rx) = ShardQueue::new(2, 2);
        assert!(queue.append(datum(1.0)).is_ok());
        assert!(queue.append(datum(2.0)).is_ok());
        let batch = rx.try_recv().expect("published batch");
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn append_rolls_back_when_channel_is_full() {
        // A single channel slot: the second full batch cannot be published.
        let (queue, mut rx) = ShardQueue::new(2, 1);
        for value in [1.0, 2.0, 3.0] {
            assert!(queue.append(datum(value)).is_ok());
        }
        let rejected = queue.append(datum(4.0)).expect_err("queue is full");
        assert!(matches!(rejected.value, DatumValue::Sample(v) if v == 4.0));

        // Draining the channel makes room again.
        let batch = rx.try_recv().expect("first batch");
        queue.return_for_reuse(batch);
        assert!(queue.append(rejected).is_ok());
    }

    #[tokio::test]
    async fn take_current_returns_partial_batch() {
        let (queue, _rx) = ShardQueue::new(10, 2);
        queue.append(datum(1.0)).unwrap();
        queue.append(datum(2.0)).unwrap();
        assert_eq!(queue.take_current().len(), 2);
        assert!(queue.take_current().is_empty());
    }

    #[tokio::test]
    async fn flush_and_close_publishes_then_closes() {
        let (queue, mut rx) = ShardQueue::new(10, 2);
        queue.append(datum(1.0)).unwrap();
        queue.flush_and_close(CancellationToken::new()).await;
        assert_eq!(rx.recv().await.expect("flushed batch").len(), 1);
        assert!(rx.recv().await.is_none());
        assert!(queue.append(datum(2.0)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn flush_and_close_gives_up_on_hard_shutdown() {
        let (queue, rx) = ShardQueue::new(2, 1);
        // Fill the single channel slot, then leave a partial batch behind
        // with nothing draining the channel.
        queue.append(datum(1.0)).unwrap();
        queue.append(datum(2.0)).unwrap();
        queue.append(datum(3.0)).unwrap();

        let hard_shutdown = CancellationToken::new();
        hard_shutdown.cancel();
        queue.flush_and_close(hard_shutdown).await;
        drop(rx);
        assert!(queue.append(datum(4.0)).is_err());
    }
}
