pub mod client;
pub mod config;
mod ewma;
pub mod manager;
pub mod metrics;
mod queue;
mod retry;
mod series;
mod shards;
mod types;

pub use client::{StoreError, WriteClient};
pub use config::{MetadataOptions, QueueOptions};
pub use manager::{LogSink, QueueManager};
pub use metrics::{DropReason, QueueMetrics, QueueSnapshot};
pub use types::DatumKind;
