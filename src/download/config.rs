//! Download configuration
//!
//! Tunables for connections, pipelining and retries. Every field has a
//! default, so a partial JSON file deserializes cleanly.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::TorrentError;

/// Largest block size peers are expected to serve
pub const MAX_BLOCK_SIZE: u32 = 128 * 1024;

/// Configuration for one download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Maximum concurrent peer connections
    pub max_connections: usize,
    /// Pipelined requests per peer
    pub max_outstanding_requests: usize,
    /// Bytes per block request
    pub block_size: u32,
    pub connect_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    /// Close a connection after this long without any message
    pub idle_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
    /// Re-queue a block request unanswered for this long
    pub request_timeout_secs: u64,
    /// Hash failures tolerated per piece before giving up
    pub max_piece_retries: u32,
    /// Times the peer list may be fetched again after running dry
    pub max_peer_refreshes: u32,
    pub peer_refresh_delay_secs: u64,
    /// Port reported to the tracker
    pub listen_port: u16,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_connections: 30,
            max_outstanding_requests: 5,
            block_size: 16384,
            connect_timeout_secs: 10,
            handshake_timeout_secs: 10,
            idle_timeout_secs: 120,
            keepalive_interval_secs: 60,
            request_timeout_secs: 60,
            max_piece_retries: 3,
            max_peer_refreshes: 3,
            peer_refresh_delay_secs: 5,
            listen_port: 6881,
        }
    }
}

impl DownloadConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn peer_refresh_delay(&self) -> Duration {
        Duration::from_secs(self.peer_refresh_delay_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("max_connections", self.max_connections as u64),
            ("max_outstanding_requests", self.max_outstanding_requests as u64),
            ("block_size", self.block_size as u64),
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("handshake_timeout_secs", self.handshake_timeout_secs),
            ("idle_timeout_secs", self.idle_timeout_secs),
            ("keepalive_interval_secs", self.keepalive_interval_secs),
            ("request_timeout_secs", self.request_timeout_secs),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(TorrentError::config_error_with_field(format!("{} must be at least 1", field), field).into());
            }
        }

        if self.block_size > MAX_BLOCK_SIZE {
            return Err(TorrentError::config_error_with_field(
                format!("block_size {} exceeds {} bytes", self.block_size, MAX_BLOCK_SIZE),
                "block_size",
            )
            .into());
        }

        if self.listen_port == 0 {
            return Err(TorrentError::config_error_with_field("Port cannot be 0", "listen_port").into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_defaults_are_valid() {
        let config = DownloadConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.idle_timeout(), Duration::from_secs(120));
        assert_eq!(config.block_size, 16384);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: DownloadConfig = serde_json::from_str(r#"{"max_connections": 4, "block_size": 8192}"#).unwrap();
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.block_size, 8192);
        assert_eq!(config.max_outstanding_requests, 5);
        assert_eq!(config.listen_port, 6881);
    }

    #[test]
    fn test_validate_rejects() {
        let zero_pipeline = DownloadConfig {
            max_outstanding_requests: 0,
            ..Default::default()
        };
        let huge_block = DownloadConfig {
            block_size: MAX_BLOCK_SIZE + 1,
            ..Default::default()
        };
        let no_port = DownloadConfig {
            listen_port: 0,
            ..Default::default()
        };

        for config in [zero_pipeline, huge_block, no_port] {
            let err = config.validate().unwrap_err();
            assert_eq!(err.downcast_ref::<TorrentError>().unwrap().kind(), ErrorKind::Config);
        }
    }
}
