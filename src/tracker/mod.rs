//! Tracker module
//!
//! Peer discovery. The download loop only sees the `PeerSource` trait, so
//! tests and the `--peer` flag can bypass the network entirely.

#[cfg(feature = "download")]
pub mod http;
pub mod response;

use std::net::SocketAddr;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::error::TorrentError;

#[cfg(feature = "download")]
pub use http::HttpTracker;
pub use response::AnnounceResponse;

/// Parameters of one announce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceRequest {
    pub announce: String,
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    /// Send `event=started`; false for re-announces
    pub started: bool,
}

impl AnnounceRequest {
    /// A fresh announce for a download that has not started yet
    pub fn started(announce: impl Into<String>, info_hash: [u8; 20], peer_id: [u8; 20], port: u16, left: u64) -> Self {
        Self {
            announce: announce.into(),
            info_hash,
            peer_id,
            port,
            uploaded: 0,
            downloaded: 0,
            left,
            started: true,
        }
    }

    /// A re-announce from a running download, carrying its current counts
    pub fn progress(
        announce: impl Into<String>,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        port: u16,
        downloaded: u64,
        left: u64,
    ) -> Self {
        Self {
            announce: announce.into(),
            info_hash,
            peer_id,
            port,
            uploaded: 0,
            downloaded,
            left,
            started: false,
        }
    }
}

/// Anything that can hand out candidate peer addresses
#[async_trait]
pub trait PeerSource: Send + Sync {
    async fn fetch_peers(&self, request: &AnnounceRequest) -> Result<Vec<SocketAddr>>;
}

/// A fixed peer list, returned on every call
#[derive(Debug, Clone, Default)]
pub struct StaticPeers {
    peers: Vec<SocketAddr>,
}

impl StaticPeers {
    pub fn new(peers: Vec<SocketAddr>) -> Self {
        Self { peers }
    }

    /// Parse `host:port` strings, failing on the first bad one
    pub fn parse<S: AsRef<str>>(peers: &[S]) -> Result<Self> {
        let peers = peers
            .iter()
            .map(|p| {
                p.as_ref().parse::<SocketAddr>().map_err(|e| {
                    TorrentError::config_error_with_field(format!("invalid peer address '{}': {}", p.as_ref(), e), "peer")
                })
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { peers })
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[async_trait]
impl PeerSource for StaticPeers {
    async fn fetch_peers(&self, _request: &AnnounceRequest) -> Result<Vec<SocketAddr>> {
        debug!("Using {} static peers", self.peers.len());
        Ok(self.peers.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_static_peers_repeat() {
        let source = StaticPeers::parse(&["127.0.0.1:6881", "10.0.0.2:51413"]).unwrap();
        let request = AnnounceRequest::started("http://tracker.invalid/announce", [1u8; 20], [2u8; 20], 6881, 100);

        let first = source.fetch_peers(&request).await.unwrap();
        let second = source.fetch_peers(&request).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
    }

    #[test]
    fn test_static_peers_rejects_garbage() {
        let err = StaticPeers::parse(&["not-an-address"]).unwrap_err();
        let typed = err.downcast_ref::<TorrentError>().unwrap();
        assert_eq!(typed.kind(), ErrorKind::Config);
    }
}
