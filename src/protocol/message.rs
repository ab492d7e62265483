//! BitTorrent protocol messages
//!
//! Defines the peer wire messages and their byte-exact encoding.

use anyhow::Result;
use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, trace};

use crate::error::TorrentError;

/// BitTorrent message IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            _ => Err(TorrentError::protocol_violation(format!("unknown message id {}", value)).into()),
        }
    }
}

/// BitTorrent protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    /// Message with an id we do not handle; its payload was skipped
    Unknown { id: u8, payload_len: usize },
}

impl Message {
    /// Get the message ID (None for KeepAlive and Unknown)
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
            Message::KeepAlive | Message::Unknown { .. } => None,
        }
    }

    /// Get the message length (excluding the length prefix)
    pub fn length(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield { bitfield } => 1 + bitfield.len() as u32,
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len() as u32,
            Message::Unknown { payload_len, .. } => 1 + *payload_len as u32,
        }
    }

    /// Serialize the message to bytes (including length prefix)
    pub fn serialize(&self) -> Vec<u8> {
        trace!("Serializing message: {:?}", self.message_id());
        let mut buf = BytesMut::with_capacity(4 + self.length() as usize);
        buf.put_u32(self.length());

        match self {
            Message::KeepAlive => {}
            Message::Choke => buf.put_u8(MessageId::Choke as u8),
            Message::Unchoke => buf.put_u8(MessageId::Unchoke as u8),
            Message::Interested => buf.put_u8(MessageId::Interested as u8),
            Message::NotInterested => buf.put_u8(MessageId::NotInterested as u8),
            Message::Have { piece_index } => {
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(*piece_index);
            }
            Message::Bitfield { bitfield } => {
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(bitfield);
            }
            Message::Request { index, begin, length } => {
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, block } => {
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Cancel { index, begin, length } => {
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Unknown { id, payload_len } => {
                buf.put_u8(*id);
                buf.put_bytes(0, *payload_len);
            }
        }

        buf.to_vec()
    }

    /// Deserialize a message from bytes (including length prefix)
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(TorrentError::protocol_violation("message shorter than its length prefix").into());
        }

        let mut buf = data;
        let length = buf.get_u32() as usize;
        if buf.remaining() != length {
            return Err(TorrentError::protocol_violation(format!(
                "length prefix {} but {} bytes follow",
                length,
                buf.remaining()
            ))
            .into());
        }

        Self::from_payload(buf)
    }

    /// Decode everything after the length prefix; an empty payload is a keep-alive
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let mut buf = payload;
        if !buf.has_remaining() {
            trace!("Received KeepAlive message");
            return Ok(Message::KeepAlive);
        }

        let id = buf.get_u8();
        let message_id = match MessageId::try_from(id) {
            Ok(message_id) => message_id,
            Err(_) => {
                debug!("Received unknown message id {} with {} payload bytes", id, buf.remaining());
                return Ok(Message::Unknown { id, payload_len: buf.remaining() });
            }
        };

        let message = match message_id {
            MessageId::Choke => {
                expect_payload(message_id, buf.len(), 0)?;
                Message::Choke
            }
            MessageId::Unchoke => {
                expect_payload(message_id, buf.len(), 0)?;
                Message::Unchoke
            }
            MessageId::Interested => {
                expect_payload(message_id, buf.len(), 0)?;
                Message::Interested
            }
            MessageId::NotInterested => {
                expect_payload(message_id, buf.len(), 0)?;
                Message::NotInterested
            }
            MessageId::Have => {
                expect_payload(message_id, buf.len(), 4)?;
                Message::Have { piece_index: buf.get_u32() }
            }
            MessageId::Bitfield => Message::Bitfield { bitfield: buf.to_vec() },
            MessageId::Request => {
                expect_payload(message_id, buf.len(), 12)?;
                Message::Request {
                    index: buf.get_u32(),
                    begin: buf.get_u32(),
                    length: buf.get_u32(),
                }
            }
            MessageId::Piece => {
                if buf.remaining() < 8 {
                    return Err(TorrentError::protocol_violation(format!(
                        "piece message needs at least 8 payload bytes, got {}",
                        buf.remaining()
                    ))
                    .into());
                }
                let index = buf.get_u32();
                let begin = buf.get_u32();
                Message::Piece { index, begin, block: buf.to_vec() }
            }
            MessageId::Cancel => {
                expect_payload(message_id, buf.len(), 12)?;
                Message::Cancel {
                    index: buf.get_u32(),
                    begin: buf.get_u32(),
                    length: buf.get_u32(),
                }
            }
        };

        trace!("Decoded message {:?}", message_id);
        Ok(message)
    }
}

fn expect_payload(id: MessageId, actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        return Err(TorrentError::protocol_violation(format!(
            "{:?} message needs {} payload bytes, got {}",
            id,
            expected,
            actual
        ))
        .into());
    }
    Ok(())
}
