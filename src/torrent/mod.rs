//! Torrent file handling module
//!
//! Parses `.torrent` files into `TorrentMetadata`.

pub mod metadata;

pub use metadata::{TorrentMetadata, HASH_LENGTH};
