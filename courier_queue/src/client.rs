use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use courier_wire::{Compression, EncodeError, WireVersion};
use snafu::Snafu;

/// How a store attempt failed, which decides what the queue does next:
/// retry with backoff, renegotiate the wire format, or abandon the batch.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StoreError {
    /// Transient: network failures, 5xx, 429. Retried with backoff, or
    /// after the delay the endpoint asked for.
    #[snafu(display("transient error from remote endpoint: {message}"))]
    Recoverable {
        message: String,
        retry_after: Option<Duration>,
    },
    /// The endpoint refused the wire version or media type. The worker
    /// renegotiates and resends the same batch.
    #[snafu(display("endpoint refused the negotiated wire format (status {status})"))]
    Renegotiate { status: u16 },
    /// Permanent rejection; the batch is abandoned and counted as failed.
    #[snafu(display("endpoint rejected the request: {message}"))]
    Rejected { message: String },
    /// The surrounding shard was hard-shut-down mid-request. Not a
    /// failure, so metrics skip it.
    #[snafu(display("request cancelled"))]
    Cancelled,
    /// The request body could not be built. Non-recoverable.
    #[snafu(display("failed to build request payload"))]
    Encode { source: EncodeError },
}

impl StoreError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StoreError::Recoverable { .. })
    }

    pub fn is_renegotiate(&self) -> bool {
        matches!(self, StoreError::Renegotiate { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StoreError::Cancelled)
    }
}

/// The transport that delivers one compressed request body to the remote
/// endpoint. Implementations live outside this crate; the queue only needs
/// the outcome classification and the endpoint's last negotiation header.
#[async_trait]
pub trait WriteClient: Send + Sync + 'static {
    /// Delivers `payload`. `attempt` counts retries of the same body,
    /// starting at zero, for transports that tag retried requests.
    async fn store(
        &self,
        payload: Bytes,
        attempt: usize,
        version: WireVersion,
        compression: Compression,
    ) -> Result<(), StoreError>;

    /// Uniquely identifies the remote in logs and metric attributes.
    fn name(&self) -> &str;

    fn endpoint(&self) -> &str;

    /// The most recent protocol-version header seen from the endpoint, if
    /// any. Drives wire-format negotiation.
    fn last_response_header(&self) -> Option<String>;

    /// Asks the endpoint which protocol versions it accepts, priming the
    /// negotiation header before the first batch. Best effort.
    async fn probe_versions(&self);
}
