//! rust-torrent-core
//!
//! BitTorrent client core: a bencode codec, torrent metadata with a canonical
//! info hash, the peer wire protocol, a verified piece pipeline and a download
//! orchestrator that writes through a pluggable output sink.

pub mod bencode;
pub mod cli;
pub mod download;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod storage;
pub mod torrent;
pub mod tracker;

pub use error::{ErrorKind, TorrentError};

pub use bencode::{decode, decode_at, encode, BencodeDict, BencodeValue};
pub use cli::{CliArgs, Command, Config, ProgressDisplay};
pub use download::{DownloadConfig, DownloadProgress, DownloadSummary, Downloader};
pub use peer::{perform_handshake, Bitfield, ConnectionState, Peer, PeerConnection, PeerEvent};
pub use protocol::{BitTorrentWire, Handshake, Message, MessageId, WireProtocol};
pub use storage::{
    BlockOutcome, BlockRequest, FileSink, MemorySink, OutputSink, PieceManager, PieceProgress, PieceState, PieceStatus,
};
pub use torrent::TorrentMetadata;
#[cfg(feature = "download")]
pub use tracker::HttpTracker;
pub use tracker::{AnnounceRequest, AnnounceResponse, PeerSource, StaticPeers};
