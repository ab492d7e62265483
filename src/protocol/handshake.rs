//! BitTorrent handshake protocol
//!
//! Builds, parses and checks the fixed 68-byte handshake.

use anyhow::Result;
use bytes::{BufMut, BytesMut};
use tracing::{debug, info, trace, warn};

use crate::error::TorrentError;

/// BitTorrent protocol identifier string
pub const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";

/// Length of the protocol string
pub const PROTOCOL_LENGTH: u8 = 19;

/// Total size of a handshake on the wire
pub const HANDSHAKE_LEN: usize = 68;

/// Client prefix of generated peer ids
pub const PEER_ID_PREFIX: &[u8; 8] = b"-RC0001-";

/// BitTorrent handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// First byte as received; 19 for a valid peer
    pub protocol_length: u8,
    /// Protocol identifier (19 bytes)
    pub protocol_id: [u8; 19],
    /// Reserved extension bits, all zero when sent by us
    pub reserved: [u8; 8],
    /// Torrent info hash
    pub info_hash: [u8; 20],
    /// Sender's peer ID
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Create our handshake for `info_hash`
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        debug!("Creating new handshake for info_hash: {}", hex::encode(info_hash));
        Self {
            protocol_length: PROTOCOL_LENGTH,
            protocol_id: *PROTOCOL_STRING,
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Generate a random peer ID: client prefix followed by 12 random bytes
    pub fn generate_peer_id() -> [u8; 20] {
        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
        peer_id[8..].copy_from_slice(&rand::random::<[u8; 12]>());
        info!("Generated new peer ID: {}", hex::encode(peer_id));
        peer_id
    }

    /// Serialize the handshake to its 68 wire bytes
    pub fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        trace!("Serializing handshake");
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(self.protocol_length);
        buf.put_slice(&self.protocol_id);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);

        let mut out = [0u8; HANDSHAKE_LEN];
        out.copy_from_slice(&buf);
        out
    }

    /// Split 68 received bytes into fields without judging them
    pub fn from_bytes(data: &[u8; HANDSHAKE_LEN]) -> Self {
        let mut handshake = Self {
            protocol_length: data[0],
            protocol_id: [0u8; 19],
            reserved: [0u8; 8],
            info_hash: [0u8; 20],
            peer_id: [0u8; 20],
        };
        handshake.protocol_id.copy_from_slice(&data[1..20]);
        handshake.reserved.copy_from_slice(&data[20..28]);
        handshake.info_hash.copy_from_slice(&data[28..48]);
        handshake.peer_id.copy_from_slice(&data[48..68]);
        handshake
    }

    /// Deserialize a handshake from a slice of at least 68 bytes
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        trace!("Deserializing handshake from {} bytes", data.len());
        let fixed: &[u8; HANDSHAKE_LEN] = data
            .get(..HANDSHAKE_LEN)
            .and_then(|d| d.try_into().ok())
            .ok_or_else(|| {
                TorrentError::protocol_violation(format!(
                    "handshake needs {} bytes, got {}",
                    HANDSHAKE_LEN,
                    data.len()
                ))
            })?;
        Ok(Self::from_bytes(fixed))
    }

    /// Check a peer's reply against our info hash.
    ///
    /// Fails with `HandshakeRejected` on a wrong length byte, protocol
    /// identifier or info hash.
    pub fn verify(&self, expected_info_hash: &[u8; 20], peer: &str) -> Result<()> {
        if self.protocol_length != PROTOCOL_LENGTH {
            warn!("Handshake from {} has protocol length {}", peer, self.protocol_length);
            return Err(TorrentError::handshake_rejected(
                peer,
                format!("protocol length {} instead of {}", self.protocol_length, PROTOCOL_LENGTH),
            )
            .into());
        }

        if &self.protocol_id != PROTOCOL_STRING {
            warn!("Handshake from {} has an unknown protocol identifier", peer);
            return Err(TorrentError::handshake_rejected(peer, "unknown protocol identifier").into());
        }

        if &self.info_hash != expected_info_hash {
            warn!(
                "Handshake from {} is for info hash {}, expected {}",
                peer,
                hex::encode(self.info_hash),
                hex::encode(expected_info_hash)
            );
            return Err(TorrentError::handshake_rejected(peer, "info hash mismatch").into());
        }

        debug!("Handshake from {} verified, peer id {}", peer, hex::encode(self.peer_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn rejected(result: Result<()>) -> bool {
        result.unwrap_err().downcast_ref::<TorrentError>().unwrap().kind() == ErrorKind::HandshakeRejected
    }

    #[test]
    fn test_handshake_layout() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let bytes = handshake.serialize();

        assert_eq!(bytes.len(), 68);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[20..28], &[0u8; 8]);
        assert_eq!(&bytes[28..48], &[1u8; 20]);
        assert_eq!(&bytes[48..68], &[2u8; 20]);
    }

    #[test]
    fn test_handshake_serialize_deserialize() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let deserialized = Handshake::deserialize(&handshake.serialize()).unwrap();
        assert_eq!(deserialized, handshake);
    }

    #[test]
    fn test_deserialize_short() {
        assert!(Handshake::deserialize(&[19u8; 40]).is_err());
    }

    #[test]
    fn test_generate_peer_id() {
        let peer_id = Handshake::generate_peer_id();
        assert_eq!(&peer_id[..8], b"-RC0001-");
        assert_ne!(peer_id, Handshake::generate_peer_id());
    }

    #[test]
    fn test_verify() {
        let info_hash = [1u8; 20];
        let handshake = Handshake::new(info_hash, [2u8; 20]);
        assert!(handshake.verify(&info_hash, "peer").is_ok());
        assert!(rejected(handshake.verify(&[3u8; 20], "peer")));
    }

    #[test]
    fn test_verify_rejects_wrong_protocol() {
        let info_hash = [1u8; 20];

        let mut bytes = Handshake::new(info_hash, [2u8; 20]).serialize();
        bytes[1..20].copy_from_slice(b"BitTorrent protocoX");
        assert!(rejected(Handshake::from_bytes(&bytes).verify(&info_hash, "peer")));

        let mut bytes = Handshake::new(info_hash, [2u8; 20]).serialize();
        bytes[0] = 18;
        assert!(rejected(Handshake::from_bytes(&bytes).verify(&info_hash, "peer")));
    }
}
