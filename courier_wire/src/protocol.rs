//! Wire-version negotiation driven by the endpoint's last response header.

use std::fmt;

use crate::compress::Compression;

/// Header carrying the protocol versions an endpoint accepts, both on
/// requests (what we are sending) and on responses (what the server would
/// prefer).
pub const VERSION_HEADER: &str = "X-Prometheus-Remote-Write-Version";

pub const CONTENT_TYPE_V1: &str = "application/x-protobuf";
pub const CONTENT_TYPE_V2: &str = "application/x-protobuf;proto=io.prometheus.write.v2.Request";

const V1_TUPLE: &str = "0.1.0";
const V2_SNAPPY_TUPLE: &str = "2.0;snappy";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireVersion {
    #[default]
    V1,
    V2,
}

impl WireVersion {
    /// The value sent in [`VERSION_HEADER`] on outgoing requests.
    pub fn header_value(self) -> &'static str {
        match self {
            WireVersion::V1 => V1_TUPLE,
            WireVersion::V2 => V2_SNAPPY_TUPLE,
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            WireVersion::V1 => CONTENT_TYPE_V1,
            WireVersion::V2 => CONTENT_TYPE_V2,
        }
    }
}

impl fmt::Display for WireVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireVersion::V1 => f.write_str("v1"),
            WireVersion::V2 => f.write_str("v2"),
        }
    }
}

/// Picks the `(compression, version)` pair for the next request.
///
/// The header is a comma-separated list of version tuples (spaces are
/// ignored). Anything we cannot parse, including a missing header, degrades
/// to v1 with snappy — every known receiver accepts that. An endpoint can
/// therefore upgrade us to v2 simply by advertising `2.0;snappy`.
pub fn negotiate(configured: WireVersion, last_header: Option<&str>) -> (Compression, WireVersion) {
    if configured == WireVersion::V1 {
        return (Compression::Snappy, WireVersion::V1);
    }
    let Some(header) = last_header else {
        return (Compression::Snappy, WireVersion::V1);
    };
    for tuple in header.split(',') {
        let tuple: String = tuple.chars().filter(|c| !c.is_whitespace()).collect();
        match tuple.as_str() {
            V2_SNAPPY_TUPLE => return (Compression::Snappy, WireVersion::V2),
            V1_TUPLE => return (Compression::Snappy, WireVersion::V1),
            _ => {}
        }
    }
    (Compression::Snappy, WireVersion::V1)
}
