//! Piece manager
//!
//! Single owner of every `PieceState`. Decides which block each peer should
//! fetch next, assembles received blocks and verifies finished pieces.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, info, trace, warn};

use crate::download::DownloadConfig;
use crate::error::TorrentError;
use crate::peer::Bitfield;
use crate::storage::piece::{BlockRequest, PieceState, PieceStatus, StoreResult};
use crate::torrent::TorrentMetadata;

/// What the manager knows about one connected peer
#[derive(Debug, Clone)]
struct PeerView {
    bitfield: Bitfield,
    choked: bool,
    /// Requests charged to this peer and not yet answered or reclaimed
    outstanding: usize,
}

/// A piece whose hash matched, ready to be persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedPiece {
    pub index: u32,
    /// Absolute byte offset in the output
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Outcome of delivering one block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Stored; the piece still lacks blocks
    Accepted,
    /// Already had it
    Duplicate,
    /// Malformed or for a piece no longer wanted; re-queued where applicable
    Rejected,
    /// Last block arrived and the hash matched
    PieceVerified(VerifiedPiece),
    /// Last block arrived but the hash did not match; the piece was re-queued
    HashMismatch { piece_index: u32, attempt: u32 },
}

/// Snapshot of download progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PieceProgress {
    pub completed_pieces: usize,
    pub total_pieces: usize,
    pub verified_bytes: u64,
    pub total_bytes: u64,
    pub failed_verifications: u32,
}

/// Scheduler and assembler for all pieces of one torrent
#[derive(Debug)]
pub struct PieceManager {
    pieces: Vec<PieceState>,
    piece_length: u64,
    total_length: u64,
    peers: HashMap<SocketAddr, PeerView>,
    max_outstanding: usize,
    max_retries: u32,
    completed: usize,
    verified_bytes: u64,
    failed_verifications: u32,
}

impl PieceManager {
    /// Create one `Missing` piece state per piece of `metadata`
    pub fn new(metadata: &TorrentMetadata, config: &DownloadConfig) -> Self {
        let pieces = metadata
            .piece_hashes
            .iter()
            .enumerate()
            .map(|(i, hash)| {
                let index = i as u32;
                PieceState::new(index, metadata.piece_size(index) as u32, *hash, config.block_size)
            })
            .collect::<Vec<_>>();

        debug!(
            "Piece manager tracking {} pieces, block size {}, pipeline {}",
            pieces.len(),
            config.block_size,
            config.max_outstanding_requests
        );

        Self {
            pieces,
            piece_length: metadata.piece_length,
            total_length: metadata.total_length,
            peers: HashMap::new(),
            max_outstanding: config.max_outstanding_requests,
            max_retries: config.max_piece_retries,
            completed: 0,
            verified_bytes: 0,
            failed_verifications: 0,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Start tracking a peer that completed its handshake
    pub fn register_peer(&mut self, addr: SocketAddr) {
        let piece_count = self.pieces.len();
        self.peers.entry(addr).or_insert_with(|| PeerView {
            bitfield: Bitfield::new(piece_count),
            choked: true,
            outstanding: 0,
        });
    }

    pub fn on_bitfield(&mut self, addr: SocketAddr, bitfield: Bitfield) {
        if let Some(view) = self.peers.get_mut(&addr) {
            trace!("Peer {} claims {} pieces", addr, bitfield.count());
            view.bitfield = bitfield;
        }
    }

    pub fn on_have(&mut self, addr: SocketAddr, piece_index: u32) {
        if let Some(view) = self.peers.get_mut(&addr) {
            // index was range-checked by the connection
            let _ = view.bitfield.set(piece_index);
        }
    }

    /// The peer choked us: every request charged to it goes back to `Missing`
    pub fn on_peer_choked(&mut self, addr: SocketAddr) -> usize {
        let requeued = self.requeue_peer(addr);
        if let Some(view) = self.peers.get_mut(&addr) {
            view.choked = true;
            view.outstanding = 0;
        }
        if requeued > 0 {
            debug!("Re-queued {} blocks after {} choked us", requeued, addr);
        }
        requeued
    }

    pub fn on_peer_unchoked(&mut self, addr: SocketAddr) {
        if let Some(view) = self.peers.get_mut(&addr) {
            view.choked = false;
        }
    }

    /// The connection to `addr` is gone; re-queue its work and forget it
    pub fn on_connection_lost(&mut self, addr: SocketAddr) -> usize {
        let requeued = self.requeue_peer(addr);
        self.peers.remove(&addr);
        if requeued > 0 {
            debug!("Re-queued {} blocks from lost peer {}", requeued, addr);
        }
        requeued
    }

    fn requeue_peer(&mut self, addr: SocketAddr) -> usize {
        self.pieces.iter_mut().map(|p| p.requeue_peer(addr)).sum()
    }

    /// Pick the next block to request from `addr`.
    ///
    /// Walks pieces in ascending index order and returns the lowest-offset
    /// unrequested block of the first wanted piece the peer claims. Returns
    /// `None` when the peer is unknown, choking us, already at its pipelining
    /// bound, or offers nothing still needed.
    pub fn next_block_for(&mut self, addr: SocketAddr) -> Option<BlockRequest> {
        let view = self.peers.get(&addr)?;
        if view.choked || view.outstanding >= self.max_outstanding {
            return None;
        }

        let block = self
            .pieces
            .iter()
            .filter(|p| p.status.is_wanted() && view.bitfield.has(p.index))
            .find_map(|p| p.next_missing_block())?;

        self.pieces[block.piece_index as usize].mark_requested(block.begin, addr, Instant::now());
        if let Some(view) = self.peers.get_mut(&addr) {
            view.outstanding += 1;
        }
        trace!("Assigned piece {} offset {} to {}", block.piece_index, block.begin, addr);
        Some(block)
    }

    /// Up to `slots` blocks for `addr`, never past its pipelining bound
    pub fn next_blocks_for(&mut self, addr: SocketAddr, slots: usize) -> Vec<BlockRequest> {
        let mut blocks = Vec::new();
        while blocks.len() < slots {
            match self.next_block_for(addr) {
                Some(block) => blocks.push(block),
                None => break,
            }
        }
        blocks
    }

    /// Deliver a block received from `addr`.
    ///
    /// Late blocks whose request was re-queued are still accepted while the
    /// block is missing. Returns `Err(RetriesExhausted)` once a piece has
    /// failed verification more than the retry bound allows.
    pub fn on_block_received(&mut self, addr: SocketAddr, piece_index: u32, begin: u32, data: &[u8]) -> Result<BlockOutcome> {
        let Some(piece) = self.pieces.get_mut(piece_index as usize) else {
            debug!("Block for unknown piece {} from {}", piece_index, addr);
            return Ok(BlockOutcome::Rejected);
        };

        if let Some(charged) = piece.requested_from(begin) {
            if let Some(view) = self.peers.get_mut(&charged) {
                view.outstanding = view.outstanding.saturating_sub(1);
            }
        }

        if !piece.status.is_wanted() {
            trace!("Block for finished piece {} from {}", piece_index, addr);
            return Ok(BlockOutcome::Duplicate);
        }

        match piece.store_block(begin, data) {
            StoreResult::Stored => {}
            StoreResult::Duplicate => return Ok(BlockOutcome::Duplicate),
            StoreResult::Invalid(reason) => {
                debug!("Rejected block {}:{} from {}: {}", piece_index, begin, addr, reason);
                return Ok(BlockOutcome::Rejected);
            }
        }

        if !piece.is_fully_received() {
            return Ok(BlockOutcome::Accepted);
        }

        piece.status = PieceStatus::Verifying;
        if piece.verify() {
            info!("Piece {} verified ({} bytes)", piece_index, piece.length);
            let data = piece.take_buffer();
            return Ok(BlockOutcome::PieceVerified(VerifiedPiece {
                index: piece_index,
                offset: piece_index as u64 * self.piece_length,
                data,
            }));
        }

        piece.reset_after_failure();
        self.failed_verifications += 1;
        let attempt = piece.failures;
        warn!("Hash mismatch for piece {} (attempt {})", piece_index, attempt);

        if attempt > self.max_retries {
            return Err(TorrentError::RetriesExhausted {
                piece_index,
                attempts: attempt,
            }
            .into());
        }

        Ok(BlockOutcome::HashMismatch { piece_index, attempt })
    }

    /// Finish a verified piece once its bytes are persisted
    pub fn mark_complete(&mut self, piece_index: u32) {
        if let Some(piece) = self.pieces.get_mut(piece_index as usize) {
            if piece.status == PieceStatus::Verifying {
                piece.mark_complete();
                self.completed += 1;
                self.verified_bytes += piece.length as u64;
                debug!("Piece {} complete ({}/{})", piece_index, self.completed, self.pieces.len());
            }
        }
    }

    /// Re-queue requests older than `timeout`; returns how many were reclaimed
    pub fn reclaim_stale_requests(&mut self, timeout: Duration) -> usize {
        let now = Instant::now();
        let mut reclaimed = 0;
        for piece in self.pieces.iter_mut() {
            for peer in piece.reclaim_stale(now, timeout) {
                if let Some(view) = self.peers.get_mut(&peer) {
                    view.outstanding = view.outstanding.saturating_sub(1);
                }
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            debug!("Reclaimed {} stale block requests", reclaimed);
        }
        reclaimed
    }

    /// Unfinished pieces that no unchoked peer claims to have
    pub fn missing_without_provider(&self) -> usize {
        self.pieces
            .iter()
            .filter(|p| p.status != PieceStatus::Complete)
            .filter(|p| !self.peers.values().any(|v| !v.choked && v.bitfield.has(p.index)))
            .count()
    }

    /// Pieces not yet complete
    pub fn missing_pieces(&self) -> usize {
        self.pieces.len() - self.completed
    }

    /// True iff every piece is verified and persisted
    pub fn is_complete(&self) -> bool {
        self.completed == self.pieces.len()
    }

    pub fn piece_status(&self, piece_index: u32) -> Option<PieceStatus> {
        self.pieces.get(piece_index as usize).map(|p| p.status)
    }

    /// Requests currently charged to `addr`
    pub fn outstanding_for(&self, addr: SocketAddr) -> usize {
        self.peers.get(&addr).map(|v| v.outstanding).unwrap_or(0)
    }

    pub fn progress(&self) -> PieceProgress {
        PieceProgress {
            completed_pieces: self.completed,
            total_pieces: self.pieces.len(),
            verified_bytes: self.verified_bytes,
            total_bytes: self.total_length,
            failed_verifications: self.failed_verifications,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use sha1::{Digest, Sha1};

    const PIECE: usize = 32768;

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    fn metadata_for(data: &[u8], piece_length: usize) -> TorrentMetadata {
        TorrentMetadata {
            announce: "http://tracker.example/announce".to_string(),
            announce_list: vec![],
            name: "test".to_string(),
            piece_length: piece_length as u64,
            total_length: data.len() as u64,
            piece_hashes: data.chunks(piece_length).map(|c| Sha1::digest(c).into()).collect(),
            info_hash: [0u8; 20],
        }
    }

    fn peer(n: u8) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, n], 6881))
    }

    fn full_bitfield(count: usize) -> Bitfield {
        let mut bitfield = Bitfield::new(count);
        for i in 0..count {
            bitfield.set(i as u32).unwrap();
        }
        bitfield
    }

    fn ready_manager(data: &[u8], config: &DownloadConfig) -> PieceManager {
        let mut manager = PieceManager::new(&metadata_for(data, PIECE), config);
        manager.register_peer(peer(1));
        manager.on_bitfield(peer(1), full_bitfield(manager.piece_count()));
        manager.on_peer_unchoked(peer(1));
        manager
    }

    fn slice(data: &[u8], block: &BlockRequest) -> Vec<u8> {
        let start = block.piece_index as usize * PIECE + block.begin as usize;
        data[start..start + block.length as usize].to_vec()
    }

    #[test]
    fn test_last_piece_shorter() {
        let data = content(PIECE + 100);
        let manager = PieceManager::new(&metadata_for(&data, PIECE), &DownloadConfig::default());
        assert_eq!(manager.piece_count(), 2);
        assert_eq!(manager.pieces[1].length, 100);
        assert_eq!(manager.pieces[1].block_count(), 1);
    }

    #[test]
    fn test_ascending_order_and_pipeline_bound() {
        let data = content(PIECE * 2);
        let config = DownloadConfig { max_outstanding_requests: 3, ..DownloadConfig::default() };
        let mut manager = ready_manager(&data, &config);

        let blocks = manager.next_blocks_for(peer(1), 10);
        let order: Vec<_> = blocks.iter().map(|b| (b.piece_index, b.begin)).collect();
        assert_eq!(order, vec![(0, 0), (0, 16384), (1, 0)]);
        assert_eq!(manager.outstanding_for(peer(1)), 3);
        assert!(manager.next_block_for(peer(1)).is_none());

        let first = blocks[0];
        manager.on_block_received(peer(1), 0, 0, &slice(&data, &first)).unwrap();
        assert_eq!(manager.outstanding_for(peer(1)), 2);
        assert_eq!(manager.next_block_for(peer(1)).map(|b| (b.piece_index, b.begin)), Some((1, 16384)));
    }

    #[test]
    fn test_peer_without_pieces_gets_nothing() {
        let data = content(PIECE);
        let mut manager = PieceManager::new(&metadata_for(&data, PIECE), &DownloadConfig::default());
        manager.register_peer(peer(2));
        manager.on_peer_unchoked(peer(2));
        assert!(manager.next_block_for(peer(2)).is_none());
        assert!(manager.next_block_for(peer(9)).is_none());
        assert_eq!(manager.missing_without_provider(), 1);
    }

    #[test]
    fn test_choked_peer_gets_nothing() {
        let data = content(PIECE);
        let mut manager = PieceManager::new(&metadata_for(&data, PIECE), &DownloadConfig::default());
        manager.register_peer(peer(1));
        manager.on_bitfield(peer(1), full_bitfield(1));
        assert!(manager.next_block_for(peer(1)).is_none());
        // a choking peer is no provider, whatever its bitfield says
        assert_eq!(manager.missing_without_provider(), 1);

        manager.on_peer_unchoked(peer(1));
        assert_eq!(manager.missing_without_provider(), 0);
        manager.on_peer_choked(peer(1));
        assert_eq!(manager.missing_without_provider(), 1);
    }

    #[test]
    fn test_full_download_in_reverse_order() {
        let data = content(PIECE);
        let mut manager = ready_manager(&data, &DownloadConfig::default());

        let blocks = manager.next_blocks_for(peer(1), 2);
        let outcome = manager.on_block_received(peer(1), 0, blocks[1].begin, &slice(&data, &blocks[1])).unwrap();
        assert_eq!(outcome, BlockOutcome::Accepted);

        let outcome = manager.on_block_received(peer(1), 0, 0, &slice(&data, &blocks[0])).unwrap();
        match outcome {
            BlockOutcome::PieceVerified(piece) => {
                assert_eq!(piece.offset, 0);
                assert_eq!(piece.data, data);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        assert_eq!(manager.piece_status(0), Some(PieceStatus::Verifying));
        assert!(!manager.is_complete());
        manager.mark_complete(0);
        assert!(manager.is_complete());
        assert_eq!(manager.progress().verified_bytes, PIECE as u64);
    }

    #[test]
    fn test_hash_mismatch_retries_then_exhausts() {
        let data = content(PIECE);
        let config = DownloadConfig { max_piece_retries: 2, ..DownloadConfig::default() };
        let mut manager = ready_manager(&data, &config);

        for attempt in 1..=3u32 {
            let blocks = manager.next_blocks_for(peer(1), 2);
            assert_eq!(blocks.len(), 2, "all blocks re-queued before attempt {}", attempt);

            manager.on_block_received(peer(1), 0, 0, &slice(&data, &blocks[0])).unwrap();
            let corrupt = vec![0xAA; blocks[1].length as usize];
            let result = manager.on_block_received(peer(1), 0, blocks[1].begin, &corrupt);

            if attempt <= 2 {
                assert_eq!(
                    result.unwrap(),
                    BlockOutcome::HashMismatch { piece_index: 0, attempt }
                );
                assert_eq!(manager.piece_status(0), Some(PieceStatus::Failed));
            } else {
                let err = result.unwrap_err();
                assert_eq!(
                    err.downcast_ref::<TorrentError>().unwrap().kind(),
                    ErrorKind::RetriesExhausted
                );
            }
        }
        assert_eq!(manager.progress().failed_verifications, 3);
    }

    #[test]
    fn test_connection_lost_requeues() {
        let data = content(PIECE);
        let mut manager = ready_manager(&data, &DownloadConfig::default());
        manager.register_peer(peer(2));
        manager.on_bitfield(peer(2), full_bitfield(1));
        manager.on_peer_unchoked(peer(2));

        assert_eq!(manager.next_blocks_for(peer(1), 5).len(), 2);
        assert!(manager.next_block_for(peer(2)).is_none());

        assert_eq!(manager.on_connection_lost(peer(1)), 2);
        assert_eq!(manager.next_blocks_for(peer(2), 5).len(), 2);
    }

    #[test]
    fn test_choke_requeues() {
        let data = content(PIECE);
        let mut manager = ready_manager(&data, &DownloadConfig::default());
        manager.next_blocks_for(peer(1), 5);

        assert_eq!(manager.on_peer_choked(peer(1)), 2);
        assert_eq!(manager.outstanding_for(peer(1)), 0);
        assert!(manager.next_block_for(peer(1)).is_none());

        manager.on_peer_unchoked(peer(1));
        assert_eq!(manager.next_blocks_for(peer(1), 5).len(), 2);
    }

    #[test]
    fn test_stale_requests_reclaimed_and_late_block_accepted() {
        let data = content(PIECE);
        let mut manager = ready_manager(&data, &DownloadConfig::default());
        let blocks = manager.next_blocks_for(peer(1), 5);

        assert_eq!(manager.reclaim_stale_requests(Duration::ZERO), 2);
        assert_eq!(manager.outstanding_for(peer(1)), 0);

        let outcome = manager.on_block_received(peer(1), 0, 0, &slice(&data, &blocks[0])).unwrap();
        assert_eq!(outcome, BlockOutcome::Accepted);
        let outcome = manager.on_block_received(peer(1), 0, 0, &slice(&data, &blocks[0])).unwrap();
        assert_eq!(outcome, BlockOutcome::Duplicate);
    }

    #[test]
    fn test_bad_block_rejected_and_requeued() {
        let data = content(PIECE);
        let mut manager = ready_manager(&data, &DownloadConfig::default());
        let blocks = manager.next_blocks_for(peer(1), 1);

        let outcome = manager.on_block_received(peer(1), 0, blocks[0].begin, &[1, 2, 3]).unwrap();
        assert_eq!(outcome, BlockOutcome::Rejected);
        assert_eq!(manager.next_block_for(peer(1)).map(|b| b.begin), Some(0));

        assert_eq!(manager.on_block_received(peer(1), 7, 0, &[0]).unwrap(), BlockOutcome::Rejected);
    }

    #[test]
    fn test_empty_torrent_is_complete() {
        let manager = PieceManager::new(&metadata_for(&[], PIECE), &DownloadConfig::default());
        assert!(manager.is_complete());
    }
}
