//! Piece storage module
//!
//! Per-piece block bookkeeping, buffering and hash verification.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use sha1::{Digest, Sha1};

/// Status of a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PieceStatus {
    /// No block requested yet
    #[default]
    Missing,
    /// At least one block requested or received
    InProgress,
    /// Hash matched; waiting for the bytes to be persisted
    Verifying,
    /// Verified and persisted
    Complete,
    /// Last attempt failed verification; every block is missing again
    Failed,
}

impl PieceStatus {
    /// Whether blocks of this piece may still be scheduled
    pub fn is_wanted(&self) -> bool {
        matches!(self, PieceStatus::Missing | PieceStatus::InProgress | PieceStatus::Failed)
    }
}

/// Status of one block within a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Missing,
    Requested { peer: SocketAddr, at: Instant },
    Received,
}

/// A block to request: (piece index, offset within piece, length)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub piece_index: u32,
    pub begin: u32,
    pub length: u32,
}

/// Result of storing one block into a piece
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreResult {
    Stored,
    /// Already received; the data was dropped
    Duplicate,
    /// Offset or length does not describe a block of this piece
    Invalid(String),
}

/// Download state of a single piece
#[derive(Debug, Clone)]
pub struct PieceState {
    pub index: u32,
    pub expected_hash: [u8; 20],
    /// Byte length; the last piece may be shorter than the nominal piece length
    pub length: u32,
    pub status: PieceStatus,
    /// Failed verifications so far
    pub failures: u32,
    block_size: u32,
    blocks: Vec<BlockStatus>,
    buffer: Vec<u8>,
}

impl PieceState {
    pub fn new(index: u32, length: u32, expected_hash: [u8; 20], block_size: u32) -> Self {
        let block_count = length.div_ceil(block_size) as usize;
        Self {
            index,
            expected_hash,
            length,
            status: PieceStatus::Missing,
            failures: 0,
            block_size,
            blocks: vec![BlockStatus::Missing; block_count],
            buffer: Vec::new(),
        }
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Length of block `block` (the last one may be shorter)
    pub fn block_length(&self, block: usize) -> u32 {
        let begin = block as u32 * self.block_size;
        (self.length - begin).min(self.block_size)
    }

    pub fn block_status(&self, block: usize) -> Option<BlockStatus> {
        self.blocks.get(block).copied()
    }

    /// Lowest-offset block neither requested nor received
    pub fn next_missing_block(&self) -> Option<BlockRequest> {
        let block = self.blocks.iter().position(|b| *b == BlockStatus::Missing)?;
        Some(BlockRequest {
            piece_index: self.index,
            begin: block as u32 * self.block_size,
            length: self.block_length(block),
        })
    }

    /// Record that `peer` was asked for the block at `begin`
    pub fn mark_requested(&mut self, begin: u32, peer: SocketAddr, at: Instant) {
        if let Some(slot) = self.blocks.get_mut((begin / self.block_size) as usize) {
            *slot = BlockStatus::Requested { peer, at };
            if self.status != PieceStatus::InProgress {
                self.status = PieceStatus::InProgress;
            }
        }
    }

    /// Who the block at `begin` is currently requested from
    pub fn requested_from(&self, begin: u32) -> Option<SocketAddr> {
        match self.blocks.get((begin / self.block_size) as usize) {
            Some(BlockStatus::Requested { peer, .. }) => Some(*peer),
            _ => None,
        }
    }

    /// Copy a received block into the buffer at its offset.
    ///
    /// Blocks may arrive in any order. A block that was requested but comes
    /// back malformed is put back to `Missing`.
    pub fn store_block(&mut self, begin: u32, data: &[u8]) -> StoreResult {
        if begin % self.block_size != 0 {
            return self.invalid(begin, format!("offset {} is not block aligned", begin));
        }
        let block = (begin / self.block_size) as usize;
        if block >= self.blocks.len() {
            return StoreResult::Invalid(format!("offset {} beyond piece of {} bytes", begin, self.length));
        }
        let expected = self.block_length(block);
        if data.len() != expected as usize {
            return self.invalid(begin, format!("block of {} bytes, expected {}", data.len(), expected));
        }
        if self.blocks[block] == BlockStatus::Received {
            return StoreResult::Duplicate;
        }

        if self.buffer.is_empty() {
            self.buffer = vec![0u8; self.length as usize];
        }
        let start = begin as usize;
        self.buffer[start..start + data.len()].copy_from_slice(data);
        self.blocks[block] = BlockStatus::Received;
        self.status = PieceStatus::InProgress;
        StoreResult::Stored
    }

    fn invalid(&mut self, begin: u32, reason: String) -> StoreResult {
        let block = (begin / self.block_size) as usize;
        if let Some(slot) = self.blocks.get_mut(block) {
            if matches!(slot, BlockStatus::Requested { .. }) {
                *slot = BlockStatus::Missing;
            }
        }
        StoreResult::Invalid(reason)
    }

    pub fn is_fully_received(&self) -> bool {
        self.blocks.iter().all(|b| *b == BlockStatus::Received)
    }

    /// Bytes received so far
    pub fn received_bytes(&self) -> u64 {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| **b == BlockStatus::Received)
            .map(|(i, _)| self.block_length(i) as u64)
            .sum()
    }

    /// Check the assembled bytes against the expected hash
    pub fn verify(&self) -> bool {
        let digest: [u8; 20] = Sha1::digest(&self.buffer).into();
        digest == self.expected_hash
    }

    /// Move the assembled bytes out, leaving the buffer empty
    pub fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    /// Discard the assembled bytes and put every block back to `Missing`
    pub fn reset_after_failure(&mut self) {
        self.failures += 1;
        self.buffer = Vec::new();
        self.blocks.iter_mut().for_each(|b| *b = BlockStatus::Missing);
        self.status = PieceStatus::Failed;
    }

    /// Re-queue every block requested from `peer`; returns how many
    pub fn requeue_peer(&mut self, peer: SocketAddr) -> usize {
        let mut count = 0;
        for slot in self.blocks.iter_mut() {
            if matches!(slot, BlockStatus::Requested { peer: p, .. } if *p == peer) {
                *slot = BlockStatus::Missing;
                count += 1;
            }
        }
        count
    }

    /// Re-queue requests older than `timeout`; returns the peers they were charged to
    pub fn reclaim_stale(&mut self, now: Instant, timeout: Duration) -> Vec<SocketAddr> {
        let mut peers = Vec::new();
        for slot in self.blocks.iter_mut() {
            if let BlockStatus::Requested { peer, at } = *slot {
                if now.saturating_duration_since(at) >= timeout {
                    *slot = BlockStatus::Missing;
                    peers.push(peer);
                }
            }
        }
        peers
    }

    /// Drop the buffer once the bytes are persisted
    pub fn mark_complete(&mut self) {
        self.buffer = Vec::new();
        self.status = PieceStatus::Complete;
    }
}
