//! Torrent metadata
//!
//! Parsed, read-only view of a single-file `.torrent` and its canonical info hash.

use std::path::Path;

use anyhow::Result;
use sha1::{Digest, Sha1};
use tracing::{debug, error, info};

use crate::bencode::{self, BencodeValue};
use crate::error::TorrentError;

/// Length of one SHA-1 digest in the `pieces` field
pub const HASH_LENGTH: usize = 20;

/// Metadata of one torrent, immutable after parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentMetadata {
    /// Primary tracker announce URL
    pub announce: String,
    /// Every tracker URL, primary first, de-duplicated
    pub announce_list: Vec<String>,
    /// Suggested file name; the hex info hash when the torrent has none
    pub name: String,
    /// Nominal piece size in bytes
    pub piece_length: u64,
    /// Total content size in bytes
    pub total_length: u64,
    /// Expected SHA-1 digest of every piece, in order
    pub piece_hashes: Vec<[u8; 20]>,
    /// SHA-1 of the canonical encoding of the `info` dictionary
    pub info_hash: [u8; 20],
}

impl TorrentMetadata {
    /// Parse metadata from the bytes of a `.torrent` file
    pub fn parse(data: &[u8]) -> Result<Self> {
        debug!("Parsing torrent metadata from {} bytes", data.len());
        let root = bencode::decode(data)?;
        Self::from_value(&root)
    }

    /// Read and parse a `.torrent` file
    pub fn parse_file(path: &Path) -> Result<Self> {
        info!("Loading torrent file from: {}", path.display());

        let data = std::fs::read(path).map_err(|e| {
            error!("Failed to read torrent file '{}': {}", path.display(), e);
            TorrentError::storage_error_full(
                "Failed to read torrent file",
                path.display().to_string(),
                e.to_string(),
            )
        })?;

        Self::parse(&data)
    }

    /// Build metadata from an already decoded root value
    pub fn from_value(root: &BencodeValue) -> Result<Self> {
        if root.as_dict().is_none() {
            return Err(TorrentError::NotADictionary.into());
        }

        let announce = text(root.require_bytes("announce")?);
        let info_value = root.require_dict("info")?;

        let info_hash: [u8; 20] = Sha1::digest(bencode::encode(info_value)).into();

        let total_length = info_value.require_integer("length")?;
        if total_length < 0 {
            return Err(TorrentError::invalid_field("length", "must not be negative").into());
        }
        let total_length = total_length as u64;

        let piece_length = info_value.require_integer("piece length")?;
        if piece_length <= 0 || piece_length > u32::MAX as i64 {
            return Err(TorrentError::invalid_field(
                "piece length",
                format!("{} is not a valid piece size", piece_length),
            )
            .into());
        }
        let piece_length = piece_length as u64;

        let piece_hashes = split_piece_hashes(info_value.require_bytes("pieces")?)?;
        let expected = total_length.div_ceil(piece_length);
        if piece_hashes.len() as u64 != expected {
            return Err(TorrentError::malformed_pieces(format!(
                "{} hashes for {} bytes in pieces of {}; expected {}",
                piece_hashes.len(),
                total_length,
                piece_length,
                expected
            ))
            .into());
        }

        let name = match info_value.get("name").and_then(BencodeValue::as_bytes) {
            Some(bytes) => text(bytes),
            None => hex::encode(info_hash),
        };

        let announce_list = flatten_announce_list(&announce, root.get("announce-list"));

        let metadata = TorrentMetadata {
            announce,
            announce_list,
            name,
            piece_length,
            total_length,
            piece_hashes,
            info_hash,
        };

        info!(
            "Parsed torrent '{}': {} bytes in {} pieces, info hash {}",
            metadata.name,
            metadata.total_length,
            metadata.piece_count(),
            metadata.info_hash_hex()
        );
        Ok(metadata)
    }

    /// Number of pieces
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Size of the piece at `index`; the last piece may be shorter
    pub fn piece_size(&self, index: u32) -> u64 {
        let start = self.piece_offset(index);
        if start >= self.total_length {
            return 0;
        }
        (self.total_length - start).min(self.piece_length)
    }

    /// Absolute byte offset of the piece at `index`
    pub fn piece_offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_length
    }

    /// Expected digest of the piece at `index`
    pub fn piece_hash(&self, index: u32) -> Option<&[u8; 20]> {
        self.piece_hashes.get(index as usize)
    }

    /// Info hash as lowercase hex
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn split_piece_hashes(pieces: &[u8]) -> Result<Vec<[u8; 20]>> {
    if pieces.len() % HASH_LENGTH != 0 {
        return Err(TorrentError::malformed_pieces(format!(
            "length {} is not a multiple of {}",
            pieces.len(),
            HASH_LENGTH
        ))
        .into());
    }

    Ok(pieces
        .chunks_exact(HASH_LENGTH)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}

fn flatten_announce_list(announce: &str, tiers: Option<&BencodeValue>) -> Vec<String> {
    let mut urls = vec![announce.to_string()];

    let tiers = tiers.and_then(BencodeValue::as_list).unwrap_or(&[]);
    for tier in tiers {
        for url in tier.as_list().unwrap_or(&[]) {
            if let Some(bytes) = url.as_bytes() {
                let url = text(bytes);
                if !urls.contains(&url) {
                    urls.push(url);
                }
            }
        }
    }

    urls
}
