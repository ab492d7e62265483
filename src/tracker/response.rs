//! Announce response parsing
//!
//! Trackers answer with a bencoded dictionary. Peers come either as a compact
//! byte string (4 address bytes + 2 port bytes, big-endian) or as a list of
//! `{ip, port}` dictionaries.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::Result;
use tracing::{debug, warn};

use crate::bencode::{decode, BencodeValue};
use crate::error::TorrentError;

const COMPACT_PEER_LEN: usize = 6;

/// Decoded tracker reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    /// Seconds the tracker wants between announces
    pub interval: Option<u64>,
    pub peers: Vec<SocketAddr>,
}

impl AnnounceResponse {
    /// Parse a raw announce body
    pub fn parse(body: &[u8]) -> Result<Self> {
        let root = decode(body).map_err(|e| TorrentError::tracker_error(format!("undecodable response: {}", e)))?;
        if root.as_dict().is_none() {
            return Err(TorrentError::tracker_error("response is not a dictionary").into());
        }

        if let Some(reason) = root.get("failure reason") {
            let reason = String::from_utf8_lossy(reason.as_bytes().unwrap_or_default()).into_owned();
            warn!("Tracker refused announce: {}", reason);
            return Err(TorrentError::tracker_error(format!("tracker failure: {}", reason)).into());
        }

        let interval = root.get("interval").and_then(|v| v.as_integer()).and_then(|i| u64::try_from(i).ok());

        let peers = match root.get("peers") {
            Some(BencodeValue::Bytes(compact)) => parse_compact_peers(compact)?,
            Some(BencodeValue::List(entries)) => entries.iter().filter_map(parse_peer_entry).collect(),
            Some(other) => {
                return Err(TorrentError::tracker_error(format!("'peers' has unexpected type {}", other.type_name())).into());
            }
            None => Vec::new(),
        };

        debug!("Tracker returned {} peers (interval {:?})", peers.len(), interval);
        Ok(Self { interval, peers })
    }
}

/// Split a compact peer string into addresses
pub fn parse_compact_peers(data: &[u8]) -> Result<Vec<SocketAddr>> {
    if data.len() % COMPACT_PEER_LEN != 0 {
        return Err(TorrentError::tracker_error(format!(
            "compact peer list of {} bytes is not a multiple of {}",
            data.len(),
            COMPACT_PEER_LEN
        ))
        .into());
    }

    Ok(data
        .chunks_exact(COMPACT_PEER_LEN)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect())
}

/// One `{ip, port}` entry; malformed entries are skipped
fn parse_peer_entry(entry: &BencodeValue) -> Option<SocketAddr> {
    let ip = entry.get("ip")?.as_str()?.parse::<IpAddr>().ok();
    let port = entry.get("port")?.as_integer().and_then(|p| u16::try_from(p).ok());
    match (ip, port) {
        (Some(ip), Some(port)) => Some(SocketAddr::new(ip, port)),
        _ => {
            debug!("Skipping malformed peer entry");
            None
        }
    }
}
