//! File storage module
//!
//! Single-file output sink backed by tokio's async file I/O.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error, info, trace};

use crate::error::TorrentError;
use crate::storage::backend::OutputSink;

/// Writes verified pieces into one pre-sized file
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: File,
    length: u64,
}

impl FileSink {
    /// Create (or truncate) the file at `path` and size it to `length` bytes
    pub async fn create(path: &Path, length: u64) -> Result<Self> {
        info!("Creating output file {} ({} bytes)", path.display(), length);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|e| {
                error!("Failed to create directory '{}': {}", parent.display(), e);
                TorrentError::storage_error_full("Failed to create directory", parent.display().to_string(), e.to_string())
            })?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await
            .map_err(|e| {
                error!("Failed to create file '{}': {}", path.display(), e);
                TorrentError::storage_error_full("Failed to create file", path.display().to_string(), e.to_string())
            })?;

        file.set_len(length).await.map_err(|e| {
            error!("Failed to set file length for '{}': {}", path.display(), e);
            TorrentError::storage_error_full("Failed to set file length", path.display().to_string(), e.to_string())
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            length,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, message: &str, e: std::io::Error) -> TorrentError {
        error!("{} '{}': {}", message, self.path.display(), e);
        TorrentError::storage_error_full(message, self.path.display().to_string(), e.to_string())
    }
}

#[async_trait]
impl OutputSink for FileSink {
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset + data.len() as u64;
        if end > self.length {
            return Err(TorrentError::storage_error_with_path(
                format!("write of {} bytes at {} exceeds file length {}", data.len(), offset, self.length),
                self.path.display().to_string(),
            )
            .into());
        }

        trace!("Writing {} bytes at offset {} to {}", data.len(), offset, self.path.display());
        if let Err(e) = self.file.seek(SeekFrom::Start(offset)).await {
            return Err(self.io_error("Failed to seek in file", e).into());
        }
        if let Err(e) = self.file.write_all(data).await {
            return Err(self.io_error("Failed to write to file", e).into());
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if let Err(e) = self.file.flush().await {
            return Err(self.io_error("Failed to flush file", e).into());
        }
        if let Err(e) = self.file.sync_all().await {
            return Err(self.io_error("Failed to sync file", e).into());
        }
        debug!("Flushed {}", self.path.display());
        Ok(())
    }
}
