//! Peer state module
//!
//! Connection lifecycle, choke/interest flags and the peer's claimed pieces.

use std::fmt;
use std::net::SocketAddr;

use anyhow::Result;
use tracing::trace;

use crate::error::TorrentError;

/// Lifecycle of one peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// TCP connect in progress
    #[default]
    Connecting,
    /// Our handshake is on the wire
    HandshakeSent,
    /// The peer's handshake matched; no choke/unchoke seen yet
    HandshakeVerified,
    /// The peer is choking us
    Choked,
    /// The peer accepts requests
    Unchoked,
    /// Terminal
    Closed,
}

impl ConnectionState {
    /// Whether the handshake has completed and the socket is still open
    pub fn is_established(&self) -> bool {
        matches!(
            self,
            ConnectionState::HandshakeVerified | ConnectionState::Choked | ConnectionState::Unchoked
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::HandshakeSent => "handshake-sent",
            ConnectionState::HandshakeVerified => "handshake-verified",
            ConnectionState::Choked => "choked",
            ConnectionState::Unchoked => "unchoked",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Pieces a peer claims to have, packed MSB-first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    /// Empty bitfield sized for `piece_count` pieces
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0u8; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    /// Validate a received bitfield payload.
    ///
    /// The byte length must be exactly ceil(piece_count / 8) and the spare
    /// bits after the last piece must be clear.
    pub fn from_bytes(bytes: &[u8], piece_count: usize) -> Result<Self> {
        let expected = piece_count.div_ceil(8);
        if bytes.len() != expected {
            return Err(TorrentError::protocol_violation(format!(
                "bitfield of {} bytes for {} pieces, expected {}",
                bytes.len(),
                piece_count,
                expected
            ))
            .into());
        }

        let spare = expected * 8 - piece_count;
        if spare > 0 {
            let mask = (1u8 << spare) - 1;
            if bytes[expected - 1] & mask != 0 {
                return Err(TorrentError::protocol_violation("bitfield has spare bits set").into());
            }
        }

        Ok(Self {
            bits: bytes.to_vec(),
            piece_count,
        })
    }

    /// Check if the piece at `index` is claimed
    pub fn has(&self, index: u32) -> bool {
        let index = index as usize;
        if index >= self.piece_count {
            return false;
        }
        (self.bits[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    /// Mark the piece at `index` as claimed
    pub fn set(&mut self, index: u32) -> Result<()> {
        let i = index as usize;
        if i >= self.piece_count {
            return Err(TorrentError::protocol_violation(format!(
                "piece index {} out of range for {} pieces",
                index, self.piece_count
            ))
            .into());
        }
        self.bits[i / 8] |= 1 << (7 - i % 8);
        Ok(())
    }

    /// Number of claimed pieces
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}

/// Represents a peer with its state and statistics
#[derive(Debug, Clone)]
pub struct Peer {
    /// Peer address
    pub addr: SocketAddr,
    /// Peer identifier from its handshake
    pub peer_id: Option<[u8; 20]>,
    /// Current state
    pub state: ConnectionState,
    /// We're interested
    pub am_interested: bool,
    /// They're choking us
    pub peer_choking: bool,
    /// They're interested
    pub peer_interested: bool,
    /// Pieces they have
    pub bitfield: Bitfield,
    /// Blocks received from this peer
    pub blocks_received: u64,
}

impl Peer {
    /// Create a new peer for a torrent of `piece_count` pieces
    pub fn new(addr: SocketAddr, piece_count: usize) -> Self {
        Self {
            addr,
            peer_id: None,
            state: ConnectionState::Connecting,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            bitfield: Bitfield::new(piece_count),
            blocks_received: 0,
        }
    }

    /// Set peer state
    pub fn set_state(&mut self, state: ConnectionState) {
        trace!("Peer {} state {} -> {}", self.addr, self.state, state);
        self.state = state;
    }

    /// Check if peer has specific piece
    pub fn has_piece(&self, piece_index: u32) -> bool {
        self.bitfield.has(piece_index)
    }

    /// Check if we can request from peer
    pub fn can_request(&self) -> bool {
        self.state == ConnectionState::Unchoked && self.am_interested
    }

    /// Get the peer ID as a hex string
    pub fn peer_id_hex(&self) -> Option<String> {
        self.peer_id.map(hex::encode)
    }
}
