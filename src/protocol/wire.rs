//! Wire protocol utilities
//!
//! Length-prefixed framing of messages and handshakes over async streams.

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use super::handshake::HANDSHAKE_LEN;
use super::{Handshake, Message};
use crate::error::TorrentError;

/// Largest accepted frame: a 1 MiB block plus the piece header
pub const MAX_MESSAGE_LEN: usize = (1 << 20) + 13;

/// WireProtocol trait for protocol utilities
#[allow(async_fn_in_trait)]
pub trait WireProtocol {
    /// Read a complete message from the stream
    async fn read_message<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> Result<Message>;

    /// Write a message to the stream
    async fn write_message<W: AsyncWrite + Unpin>(&mut self, writer: &mut W, message: &Message) -> Result<()>;

    /// Read the 68 bytes of a handshake from the stream
    async fn read_handshake<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> Result<Handshake>;

    /// Write a handshake to the stream
    async fn write_handshake<W: AsyncWrite + Unpin>(&mut self, writer: &mut W, handshake: &Handshake) -> Result<()>;
}

/// Default implementation of WireProtocol
#[derive(Debug, Clone, Copy)]
pub struct BitTorrentWire {
    max_message_len: usize,
}

impl BitTorrentWire {
    pub fn new() -> Self {
        Self { max_message_len: MAX_MESSAGE_LEN }
    }

    /// Framing with a custom size guard
    #[cfg(test)]
    pub(crate) fn with_max_message_len(max_message_len: usize) -> Self {
        Self { max_message_len }
    }
}

impl Default for BitTorrentWire {
    fn default() -> Self {
        Self::new()
    }
}

impl WireProtocol for BitTorrentWire {
    async fn read_message<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> Result<Message> {
        let length = reader.read_u32().await? as usize;

        if length > self.max_message_len {
            return Err(TorrentError::protocol_violation(format!(
                "message of {} bytes exceeds limit of {}",
                length, self.max_message_len
            ))
            .into());
        }

        let mut payload = vec![0u8; length];
        reader.read_exact(&mut payload).await?;
        trace!("Read frame of {} bytes", length);

        Message::from_payload(&payload)
    }

    async fn write_message<W: AsyncWrite + Unpin>(&mut self, writer: &mut W, message: &Message) -> Result<()> {
        writer.write_all(&message.serialize()).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_handshake<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> Result<Handshake> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        reader.read_exact(&mut buf).await?;
        Ok(Handshake::from_bytes(&buf))
    }

    async fn write_handshake<W: AsyncWrite + Unpin>(&mut self, writer: &mut W, handshake: &Handshake) -> Result<()> {
        writer.write_all(&handshake.serialize()).await?;
        writer.flush().await?;
        Ok(())
    }
}
