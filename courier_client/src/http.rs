//! HTTP transport for the remote-write queue: posts compressed protobuf
//! bodies and classifies the endpoint's answers into the queue's error
//! taxonomy.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use courier_queue::{StoreError, WriteClient};
use courier_wire::protocol::VERSION_HEADER;
use courier_wire::{Compression, WireVersion};
use parking_lot::RwLock;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, HeaderMap, RETRY_AFTER, USER_AGENT};
use snafu::{ResultExt, Snafu};
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT_VALUE: &str = concat!("courier/", env!("CARGO_PKG_VERSION"));
const BODY_SNIPPET_LIMIT: usize = 256;

#[derive(Debug, Snafu)]
pub enum HttpClientError {
    #[snafu(display("failed to build HTTP client"))]
    Build { source: reqwest::Error },
}

/// A [`WriteClient`] over reqwest. Remembers the endpoint's most recent
/// protocol-version header so the queue can negotiate the wire format.
pub struct HttpWriteClient {
    name: String,
    endpoint: reqwest::Url,
    endpoint_display: String,
    client: reqwest::Client,
    last_header: RwLock<Option<String>>,
}

impl HttpWriteClient {
    pub fn new(name: impl Into<String>, endpoint: reqwest::Url) -> Result<Self, HttpClientError> {
        Self::with_timeout(name, endpoint, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        name: impl Into<String>,
        endpoint: reqwest::Url,
        timeout: Duration,
    ) -> Result<Self, HttpClientError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context(BuildSnafu)?;
        Ok(Self {
            name: name.into(),
            endpoint_display: endpoint.to_string(),
            endpoint,
            client,
            last_header: RwLock::new(None),
        })
    }

    fn record_response_header(&self, headers: &HeaderMap) {
        if let Some(value) = headers
            .get(VERSION_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            *self.last_header.write() = Some(value.to_owned());
        }
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Maps a non-success status to the queue's error taxonomy: 406 and 400
/// ask for a different wire format, 429 and 5xx are worth retrying, and
/// everything else permanently rejects the batch.
fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: String,
) -> StoreError {
    match status {
        StatusCode::NOT_ACCEPTABLE | StatusCode::BAD_REQUEST => StoreError::Renegotiate {
            status: status.as_u16(),
        },
        StatusCode::TOO_MANY_REQUESTS => StoreError::Recoverable {
            message: format!("{status}: {body}"),
            retry_after,
        },
        status if status.is_server_error() => StoreError::Recoverable {
            message: format!("{status}: {body}"),
            retry_after,
        },
        status => StoreError::Rejected {
            message: format!("{status}: {body}"),
        },
    }
}

#[async_trait]
impl WriteClient for HttpWriteClient {
    async fn store(
        &self,
        payload: Bytes,
        attempt: usize,
        version: WireVersion,
        compression: Compression,
    ) -> Result<(), StoreError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, version.content_type())
            .header(CONTENT_ENCODING, compression.as_str())
            .header(VERSION_HEADER, version.header_value())
            .header(USER_AGENT, USER_AGENT_VALUE)
            .header("Retry-Attempt", attempt as u64)
            .body(payload)
            .send()
            .await
            .map_err(|source| StoreError::Recoverable {
                message: source.to_string(),
                retry_after: None,
            })?;

        // Headers arrive on every response, including errors; an endpoint
        // can upgrade or downgrade us at any time.
        self.record_response_header(response.headers());

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let retry_after = parse_retry_after(response.headers());
        let mut body = response.text().await.unwrap_or_default();
        body.truncate(BODY_SNIPPET_LIMIT);
        Err(classify_status(status, retry_after, body))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn endpoint(&self) -> &str {
        &self.endpoint_display
    }

    fn last_response_header(&self) -> Option<String> {
        self.last_header.read().clone()
    }

    async fn probe_versions(&self) {
        match self.client.head(self.endpoint.clone()).send().await {
            Ok(response) => self.record_response_header(response.headers()),
            Err(error) => debug!(error = %error, "protocol version probe failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;

    use super::*;

    #[test]
    fn retry_after_parses_whole_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("2"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(2)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("not-a-number"));
        assert_eq!(parse_retry_after(&headers), None);

        assert_eq!(parse_retry_after(&HeaderMap::new()), None);
    }

    #[test]
    fn statuses_map_to_the_error_taxonomy() {
        assert!(matches!(
            classify_status(StatusCode::NOT_ACCEPTABLE, None, String::new()),
            StoreError::Renegotiate { status: 406 }
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, None, String::new()),
            StoreError::Renegotiate { status: 400 }
        ));
        assert!(matches!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR, None, String::new()),
            StoreError::Recoverable { .. }
        ));
        let throttled = classify_status(
            StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(5)),
            String::new(),
        );
        assert!(matches!(
            throttled,
            StoreError::Recoverable {
                retry_after: Some(delay),
                ..
            } if delay == Duration::from_secs(5)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None, "denied".into()),
            StoreError::Rejected { .. }
        ));
    }
}
