//! Storage module
//!
//! Piece bookkeeping, the piece manager, and output sinks for verified bytes.

pub mod backend;
pub mod file;
pub mod manager;
pub mod piece;

// Re-export sink types
pub use backend::{MemorySink, OutputSink};
pub use file::FileSink;

// Re-export piece types
pub use manager::{BlockOutcome, PieceManager, PieceProgress, VerifiedPiece};
pub use piece::{BlockRequest, BlockStatus, PieceState, PieceStatus, StoreResult};
