//! BitTorrent protocol module
//!
//! Implements the BitTorrent peer wire protocol encoding.

pub mod handshake;
pub mod message;
pub mod wire;

// Re-export main types
pub use handshake::{Handshake, HANDSHAKE_LEN, PEER_ID_PREFIX, PROTOCOL_LENGTH, PROTOCOL_STRING};
pub use message::{Message, MessageId};
pub use wire::{BitTorrentWire, WireProtocol, MAX_MESSAGE_LEN};
