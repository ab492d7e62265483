//! Error types for the torrent core
//!
//! One error enum covers the bencode codec, torrent metadata, peer connections,
//! piece verification and the download orchestrator. Fallible functions in this
//! crate return `anyhow::Result`; the typed error can be recovered with
//! `err.downcast_ref::<TorrentError>()`.

use std::fmt;

/// Discriminant of a [`TorrentError`], used to classify errors without matching fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MalformedLength,
    MalformedInteger,
    NonStringKey,
    UnsupportedTag,
    UnexpectedEndOfInput,
    NestingTooDeep,
    NotADictionary,
    MissingField,
    MalformedPieces,
    InvalidField,
    ConnectFailed,
    HandshakeTimeout,
    HandshakeRejected,
    ProtocolViolation,
    IdleTimeout,
    PeerDisconnected,
    HashMismatch,
    RetriesExhausted,
    NoPeersAvailable,
    Storage,
    Tracker,
    Config,
}

/// Comprehensive error type for torrent operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorrentError {
    /// Byte string length prefix is not a number, lacks its `:` or overruns the input
    MalformedLength { position: usize, message: String },

    /// Integer body is empty, non-numeric, has leading zeros or overflows
    MalformedInteger { position: usize, message: String },

    /// Dictionary key is not a byte string
    NonStringKey { position: usize },

    /// Leading byte does not start any bencode value
    UnsupportedTag { position: usize, tag: u8 },

    /// Input ended before a value or terminator was complete
    UnexpectedEndOfInput { position: usize },

    /// Lists/dictionaries nested beyond the decoder's depth bound
    NestingTooDeep { position: usize },

    /// Top-level torrent value is not a dictionary
    NotADictionary,

    /// Required metadata field is absent
    MissingField { field: String },

    /// `pieces` is not a whole number of 20-byte digests or does not match the length
    MalformedPieces { message: String },

    /// Metadata field has the wrong type or an out-of-range value
    InvalidField { field: String, message: String },

    /// TCP connect failed or timed out
    ConnectFailed { peer: String, source: Option<String> },

    /// Peer did not answer the handshake in time, or answered short
    HandshakeTimeout { peer: String, source: Option<String> },

    /// Peer answered with a wrong protocol identifier or info hash
    HandshakeRejected { peer: String, reason: String },

    /// Malformed frame, unexpected payload size or out-of-range piece index
    ProtocolViolation { peer: Option<String>, message: String },

    /// No bytes arrived from the peer for the configured interval
    IdleTimeout { peer: String, idle_secs: u64 },

    /// The peer closed the socket or an I/O error occurred mid-session
    PeerDisconnected { peer: String, source: Option<String> },

    /// A completed piece did not match its expected digest
    HashMismatch { piece_index: u32, attempt: u32 },

    /// A piece failed verification more often than the retry bound allows
    RetriesExhausted { piece_index: u32, attempts: u32 },

    /// Every known peer is gone while pieces are still missing
    NoPeersAvailable { missing_pieces: usize, peers_tried: usize },

    /// Output sink and file I/O errors
    StorageError {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },

    /// Tracker announce errors
    TrackerError {
        message: String,
        url: Option<String>,
        source: Option<String>,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },
}

impl TorrentError {
    /// Create a new MissingField error
    pub fn missing_field(field: impl Into<String>) -> Self {
        TorrentError::MissingField { field: field.into() }
    }

    /// Create a new InvalidField error
    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        TorrentError::InvalidField {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new MalformedPieces error
    pub fn malformed_pieces(message: impl Into<String>) -> Self {
        TorrentError::MalformedPieces { message: message.into() }
    }

    /// Create a new ProtocolViolation without peer context
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        TorrentError::ProtocolViolation {
            peer: None,
            message: message.into(),
        }
    }

    /// Create a new ProtocolViolation with peer address
    pub fn protocol_violation_with_peer(message: impl Into<String>, peer: impl Into<String>) -> Self {
        TorrentError::ProtocolViolation {
            peer: Some(peer.into()),
            message: message.into(),
        }
    }

    /// Create a new ConnectFailed error
    pub fn connect_failed(peer: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ConnectFailed {
            peer: peer.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new HandshakeTimeout error
    pub fn handshake_timeout(peer: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::HandshakeTimeout {
            peer: peer.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new HandshakeRejected error
    pub fn handshake_rejected(peer: impl Into<String>, reason: impl Into<String>) -> Self {
        TorrentError::HandshakeRejected {
            peer: peer.into(),
            reason: reason.into(),
        }
    }

    /// Create a new PeerDisconnected error
    pub fn peer_disconnected(peer: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::PeerDisconnected {
            peer: peer.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new StorageError
    pub fn storage_error(message: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: None,
            source: None,
        }
    }

    /// Create a new StorageError with path
    pub fn storage_error_with_path(message: impl Into<String>, path: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: Some(path.into()),
            source: None,
        }
    }

    /// Create a new StorageError with path and source
    pub fn storage_error_full(message: impl Into<String>, path: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: Some(path.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new TrackerError
    pub fn tracker_error(message: impl Into<String>) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            url: None,
            source: None,
        }
    }

    /// Create a new TrackerError with url and source
    pub fn tracker_error_full(message: impl Into<String>, url: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            url: Some(url.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ConfigError
    pub fn config_error(message: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Attach a peer address to errors raised below the connection layer
    pub fn with_peer(mut self, addr: impl Into<String>) -> Self {
        if let TorrentError::ProtocolViolation { peer, .. } = &mut self {
            if peer.is_none() {
                *peer = Some(addr.into());
            }
        }
        self
    }

    /// Get the kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            TorrentError::MalformedLength { .. } => ErrorKind::MalformedLength,
            TorrentError::MalformedInteger { .. } => ErrorKind::MalformedInteger,
            TorrentError::NonStringKey { .. } => ErrorKind::NonStringKey,
            TorrentError::UnsupportedTag { .. } => ErrorKind::UnsupportedTag,
            TorrentError::UnexpectedEndOfInput { .. } => ErrorKind::UnexpectedEndOfInput,
            TorrentError::NestingTooDeep { .. } => ErrorKind::NestingTooDeep,
            TorrentError::NotADictionary => ErrorKind::NotADictionary,
            TorrentError::MissingField { .. } => ErrorKind::MissingField,
            TorrentError::MalformedPieces { .. } => ErrorKind::MalformedPieces,
            TorrentError::InvalidField { .. } => ErrorKind::InvalidField,
            TorrentError::ConnectFailed { .. } => ErrorKind::ConnectFailed,
            TorrentError::HandshakeTimeout { .. } => ErrorKind::HandshakeTimeout,
            TorrentError::HandshakeRejected { .. } => ErrorKind::HandshakeRejected,
            TorrentError::ProtocolViolation { .. } => ErrorKind::ProtocolViolation,
            TorrentError::IdleTimeout { .. } => ErrorKind::IdleTimeout,
            TorrentError::PeerDisconnected { .. } => ErrorKind::PeerDisconnected,
            TorrentError::HashMismatch { .. } => ErrorKind::HashMismatch,
            TorrentError::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            TorrentError::NoPeersAvailable { .. } => ErrorKind::NoPeersAvailable,
            TorrentError::StorageError { .. } => ErrorKind::Storage,
            TorrentError::TrackerError { .. } => ErrorKind::Tracker,
            TorrentError::ConfigError { .. } => ErrorKind::Config,
        }
    }

    /// Whether this error aborts the whole download.
    ///
    /// Peer connection errors and hash mismatches within the retry bound are
    /// recovered locally; tracker errors are retried through a peer refresh.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::ConnectFailed
                | ErrorKind::HandshakeTimeout
                | ErrorKind::HandshakeRejected
                | ErrorKind::ProtocolViolation
                | ErrorKind::IdleTimeout
                | ErrorKind::PeerDisconnected
                | ErrorKind::HashMismatch
                | ErrorKind::Tracker
        )
    }
}

fn write_source(f: &mut fmt::Formatter<'_>, source: &Option<String>) -> fmt::Result {
    match source {
        Some(s) => write!(f, " (source: {})", s),
        None => Ok(()),
    }
}

impl fmt::Display for TorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorrentError::MalformedLength { position, message } => {
                write!(f, "Malformed byte string length at position {}: {}", position, message)
            }
            TorrentError::MalformedInteger { position, message } => {
                write!(f, "Malformed integer at position {}: {}", position, message)
            }
            TorrentError::NonStringKey { position } => {
                write!(f, "Dictionary key at position {} is not a byte string", position)
            }
            TorrentError::UnsupportedTag { position, tag } => {
                write!(f, "Unsupported bencode tag 0x{:02x} at position {}", tag, position)
            }
            TorrentError::UnexpectedEndOfInput { position } => {
                write!(f, "Unexpected end of input at position {}", position)
            }
            TorrentError::NestingTooDeep { position } => {
                write!(f, "Bencode nesting too deep at position {}", position)
            }
            TorrentError::NotADictionary => write!(f, "Torrent file is not a bencoded dictionary"),
            TorrentError::MissingField { field } => write!(f, "Missing field: {}", field),
            TorrentError::MalformedPieces { message } => write!(f, "Malformed pieces: {}", message),
            TorrentError::InvalidField { field, message } => {
                write!(f, "Invalid field {}: {}", field, message)
            }
            TorrentError::ConnectFailed { peer, source } => {
                write!(f, "Connect failed (peer: {})", peer)?;
                write_source(f, source)
            }
            TorrentError::HandshakeTimeout { peer, source } => {
                write!(f, "Handshake timeout (peer: {})", peer)?;
                write_source(f, source)
            }
            TorrentError::HandshakeRejected { peer, reason } => {
                write!(f, "Handshake rejected: {} (peer: {})", reason, peer)
            }
            TorrentError::ProtocolViolation { peer, message } => match peer {
                Some(p) => write!(f, "Protocol violation: {} (peer: {})", message, p),
                None => write!(f, "Protocol violation: {}", message),
            },
            TorrentError::IdleTimeout { peer, idle_secs } => {
                write!(f, "Idle timeout after {}s (peer: {})", idle_secs, peer)
            }
            TorrentError::PeerDisconnected { peer, source } => {
                write!(f, "Peer disconnected (peer: {})", peer)?;
                write_source(f, source)
            }
            TorrentError::HashMismatch { piece_index, attempt } => {
                write!(f, "Hash mismatch for piece {} (attempt {})", piece_index, attempt)
            }
            TorrentError::RetriesExhausted { piece_index, attempts } => {
                write!(f, "Retries exhausted for piece {} after {} failed verifications", piece_index, attempts)
            }
            TorrentError::NoPeersAvailable { missing_pieces, peers_tried } => {
                write!(
                    f,
                    "No peers available: {} pieces still missing after trying {} peers",
                    missing_pieces, peers_tried
                )
            }
            TorrentError::StorageError { message, path, source } => {
                match (path, source) {
                    (Some(p), Some(s)) => write!(f, "Storage error: {} (path: {}, source: {})", message, p, s),
                    (Some(p), None) => write!(f, "Storage error: {} (path: {})", message, p),
                    (None, Some(s)) => write!(f, "Storage error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Storage error: {}", message),
                }
            }
            TorrentError::TrackerError { message, url, source } => {
                match (url, source) {
                    (Some(u), Some(s)) => write!(f, "Tracker error: {} (url: {}, source: {})", message, u, s),
                    (Some(u), None) => write!(f, "Tracker error: {} (url: {})", message, u),
                    (None, Some(s)) => write!(f, "Tracker error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Tracker error: {}", message),
                }
            }
            TorrentError::ConfigError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Config error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Config error: {}", message)
                }
            }
        }
    }
}

impl std::error::Error for TorrentError {}

impl From<std::io::Error> for TorrentError {
    fn from(err: std::io::Error) -> Self {
        TorrentError::storage_error_full(err.to_string(), "unknown".to_string(), err.kind().to_string())
    }
}

impl From<serde_json::Error> for TorrentError {
    fn from(err: serde_json::Error) -> Self {
        TorrentError::config_error(format!("Failed to parse JSON config: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for TorrentError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        TorrentError::peer_disconnected("unknown", "Operation timed out")
    }
}

impl From<std::net::AddrParseError> for TorrentError {
    fn from(err: std::net::AddrParseError) -> Self {
        TorrentError::config_error_with_field(format!("Failed to parse address: {}", err), "peer")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_tag_display() {
        let err = TorrentError::UnsupportedTag { position: 3, tag: b'x' };
        assert_eq!(err.to_string(), "Unsupported bencode tag 0x78 at position 3");
    }

    #[test]
    fn test_missing_field() {
        let err = TorrentError::missing_field("info.piece length");
        assert_eq!(err.kind(), ErrorKind::MissingField);
        assert!(err.to_string().contains("info.piece length"));
    }

    #[test]
    fn test_handshake_rejected_has_peer() {
        let err = TorrentError::handshake_rejected("127.0.0.1:6881", "info hash mismatch");
        assert!(err.to_string().contains("Handshake rejected"));
        assert!(err.to_string().contains("127.0.0.1:6881"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_with_peer_fills_missing_peer_only() {
        let err = TorrentError::protocol_violation("bad frame").with_peer("10.0.0.1:1");
        assert!(err.to_string().contains("10.0.0.1:1"));

        let err = TorrentError::protocol_violation_with_peer("bad frame", "10.0.0.2:2").with_peer("10.0.0.1:1");
        assert!(err.to_string().contains("10.0.0.2:2"));
        assert!(!err.to_string().contains("10.0.0.1:1"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(TorrentError::RetriesExhausted { piece_index: 1, attempts: 4 }.is_fatal());
        assert!(TorrentError::NoPeersAvailable { missing_pieces: 2, peers_tried: 3 }.is_fatal());
        assert!(TorrentError::NotADictionary.is_fatal());
        assert!(!TorrentError::HashMismatch { piece_index: 1, attempt: 1 }.is_fatal());
        assert!(!TorrentError::IdleTimeout { peer: "p".into(), idle_secs: 120 }.is_fatal());
        assert!(!TorrentError::tracker_error("down").is_fatal());
    }

    #[test]
    fn test_retries_exhausted_display() {
        let err = TorrentError::RetriesExhausted { piece_index: 7, attempts: 4 };
        assert!(err.to_string().contains("piece 7"));
    }

    #[test]
    fn test_storage_error_with_path() {
        let err = TorrentError::storage_error_with_path("File not found", "/path/to/file");
        assert!(err.to_string().contains("Storage error"));
        assert!(err.to_string().contains("/path/to/file"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let err: TorrentError = io_err.into();
        assert_eq!(err.kind(), ErrorKind::Storage);
    }

    #[test]
    fn test_from_addr_parse_error() {
        let addr_err = "invalid:address".parse::<std::net::SocketAddr>().unwrap_err();
        let err: TorrentError = addr_err.into();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = TorrentError::NotADictionary.into();
        let typed = err.downcast_ref::<TorrentError>().unwrap();
        assert_eq!(typed.kind(), ErrorKind::NotADictionary);
    }
}
