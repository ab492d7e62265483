//! Download module
//!
//! Configuration and the orchestrator that ties peers, pieces and the output sink together.

pub mod config;
pub mod orchestrator;

pub use config::{DownloadConfig, MAX_BLOCK_SIZE};
pub use orchestrator::{DownloadProgress, DownloadSummary, Downloader};
