//! Output sink abstraction
//!
//! Verified piece bytes leave the core through an `OutputSink`, so the
//! download loop never depends on a particular storage mechanism.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use crate::error::TorrentError;

/// Destination for verified bytes
///
/// A write either fully succeeds or fails; partial writes are reported as errors.
#[async_trait]
pub trait OutputSink: Send {
    /// Persist `data` at absolute byte `offset`
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Flush buffered writes; called once after the last piece
    async fn flush(&mut self) -> Result<()>;
}

/// In-memory sink recording every write, for tests and embedding
///
/// Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    writes: Arc<Mutex<Vec<(u64, Vec<u8>)>>>,
    flushed: Arc<Mutex<bool>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `(offset, bytes)` write so far, in call order
    pub fn writes(&self) -> Vec<(u64, Vec<u8>)> {
        self.writes.lock().map(|w| w.clone()).unwrap_or_default()
    }

    /// Total bytes written
    pub fn bytes_written(&self) -> u64 {
        self.writes().iter().map(|(_, d)| d.len() as u64).sum()
    }

    /// Reassemble the written ranges into one buffer of `len` bytes
    pub fn contents(&self, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        for (offset, data) in self.writes() {
            let start = offset as usize;
            let end = (start + data.len()).min(len);
            if start < end {
                out[start..end].copy_from_slice(&data[..end - start]);
            }
        }
        out
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed.lock().map(|f| *f).unwrap_or(false)
    }
}

#[async_trait]
impl OutputSink for MemorySink {
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let mut writes = self
            .writes
            .lock()
            .map_err(|_| TorrentError::storage_error("memory sink lock poisoned"))?;
        writes.push((offset, data.to_vec()));
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        let mut flushed = self
            .flushed
            .lock()
            .map_err(|_| TorrentError::storage_error("memory sink lock poisoned"))?;
        *flushed = true;
        Ok(())
    }
}
