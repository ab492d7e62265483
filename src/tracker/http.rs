//! HTTP tracker client

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};
use url::Url;

use crate::error::TorrentError;
use crate::tracker::response::AnnounceResponse;
use crate::tracker::{AnnounceRequest, PeerSource};

/// Announces over HTTP(S) and parses the bencoded reply
#[derive(Debug, Clone)]
pub struct HttpTracker {
    client: reqwest::Client,
}

impl HttpTracker {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TorrentError::tracker_error(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// Build the announce URL.
    ///
    /// `info_hash` and `peer_id` are raw bytes and get percent-encoded byte by byte.
    pub fn announce_url(request: &AnnounceRequest) -> Result<String> {
        let base = Url::parse(&request.announce).map_err(|e| {
            TorrentError::tracker_error_full("invalid announce URL", request.announce.clone(), e.to_string())
        })?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(TorrentError::tracker_error_full(
                "unsupported tracker scheme",
                request.announce.clone(),
                base.scheme().to_string(),
            )
            .into());
        }

        let separator = if base.query().is_some() { '&' } else { '?' };
        let mut url = format!(
            "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            base,
            separator,
            urlencoding::encode_binary(&request.info_hash),
            urlencoding::encode_binary(&request.peer_id),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
        );
        if request.started {
            url.push_str("&event=started");
        }
        Ok(url)
    }
}

#[async_trait]
impl PeerSource for HttpTracker {
    async fn fetch_peers(&self, request: &AnnounceRequest) -> Result<Vec<SocketAddr>> {
        let url = Self::announce_url(request)?;
        info!("Announcing to tracker {}", request.announce);
        debug!("Announce URL: {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TorrentError::tracker_error_full("announce request failed", request.announce.clone(), e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TorrentError::tracker_error_full(
                format!("tracker answered HTTP {}", status),
                request.announce.clone(),
                status.to_string(),
            )
            .into());
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| TorrentError::tracker_error_full("failed to read announce body", request.announce.clone(), e.to_string()))?;

        let parsed = AnnounceResponse::parse(&body)?;
        Ok(parsed.peers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(announce: &str) -> AnnounceRequest {
        let mut info_hash = [0u8; 20];
        info_hash[0] = 0x12;
        info_hash[1] = b'a';
        info_hash[19] = 0xFF;
        AnnounceRequest::started(announce, info_hash, *b"-RC0001-abcdefghijkl", 6881, 4096)
    }

    #[test]
    fn test_announce_url_encodes_binary() {
        let url = HttpTracker::announce_url(&request("http://tracker.example.com/announce")).unwrap();
        assert!(url.starts_with("http://tracker.example.com/announce?info_hash=%12a%00"));
        assert!(url.contains("%FF&peer_id=-RC0001-abcdefghijkl&port=6881"));
        assert!(url.contains("&left=4096&compact=1&event=started"));
    }

    #[test]
    fn test_reannounce_reports_counts_without_event() {
        let progress = AnnounceRequest::progress(
            "http://tracker.example.com/announce",
            [0u8; 20],
            *b"-RC0001-abcdefghijkl",
            6881,
            16384,
            4096,
        );
        let url = HttpTracker::announce_url(&progress).unwrap();
        assert!(url.ends_with("&uploaded=0&downloaded=16384&left=4096&compact=1"));
        assert!(!url.contains("event="));
    }

    #[test]
    fn test_announce_url_keeps_existing_query() {
        let url = HttpTracker::announce_url(&request("https://t.example/announce?passkey=xyz")).unwrap();
        assert!(url.starts_with("https://t.example/announce?passkey=xyz&info_hash="));
    }

    #[test]
    fn test_announce_url_rejects_udp() {
        assert!(HttpTracker::announce_url(&request("udp://tracker.example.com:80")).is_err());
        assert!(HttpTracker::announce_url(&request("not a url")).is_err());
    }
}
