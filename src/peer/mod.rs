//! Peer module
//!
//! Peer connection state, the socket-level connection and the per-peer session task.

pub mod connection;
pub mod session;
pub mod state;

// Re-export main types
pub use connection::{peer_error, perform_handshake, MessageReader, PeerConnection};
pub use session::{run_session, PeerEvent, SessionContext};
pub use state::{Bitfield, ConnectionState, Peer};
