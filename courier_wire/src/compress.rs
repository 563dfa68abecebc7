use std::fmt;

use snafu::ResultExt;

use crate::request::{CompressSnafu, DecompressSnafu, EncodeError};

/// Compression scheme applied to the marshalled request body. Snappy block
/// format is the only scheme both protocol versions recognise today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    Snappy,
}

impl Compression {
    pub fn as_str(self) -> &'static str {
        match self {
            Compression::Snappy => "snappy",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn compress_payload(raw: &[u8], compression: Compression) -> Result<Vec<u8>, EncodeError> {
    match compression {
        Compression::Snappy => snap::raw::Encoder::new()
            .compress_vec(raw)
            .context(CompressSnafu { compression }),
    }
}

/// Inverse of [`compress_payload`]; used by receivers and test harnesses.
pub fn decompress_payload(body: &[u8], compression: Compression) -> Result<Vec<u8>, EncodeError> {
    match compression {
        Compression::Snappy => snap::raw::Decoder::new()
            .decompress_vec(body)
            .context(DecompressSnafu { compression }),
    }
}
