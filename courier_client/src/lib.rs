pub mod http;

pub use http::{HttpClientError, HttpWriteClient};
