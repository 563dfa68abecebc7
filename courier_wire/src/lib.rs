pub mod compress;
pub mod convert;
pub mod protocol;
pub mod request;
pub mod symbols;
pub mod v1;
pub mod v2;

pub use compress::{Compression, compress_payload, decompress_payload};
pub use protocol::{WireVersion, negotiate};
pub use request::{BuiltRequest, EncodeError, build_v2_write_request, build_write_request};
pub use symbols::SymbolTable;
