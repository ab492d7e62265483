//! Peer connection module
//!
//! Connects to one peer, performs the handshake and splits the socket into a
//! writer-side `PeerConnection` and a reader-side `MessageReader`.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::download::DownloadConfig;
use crate::error::TorrentError;
use crate::peer::{Bitfield, ConnectionState, Peer};
use crate::protocol::{BitTorrentWire, Handshake, Message, WireProtocol};
use crate::storage::BlockRequest;

/// Convert a lower-level failure into a typed error carrying the peer address
pub fn peer_error(err: anyhow::Error, addr: SocketAddr) -> TorrentError {
    match err.downcast::<TorrentError>() {
        Ok(typed) => typed.with_peer(addr.to_string()),
        Err(other) => TorrentError::peer_disconnected(addr.to_string(), other.to_string()),
    }
}

/// Exchange handshakes over an open stream.
///
/// Sends ours, then waits up to `handshake_timeout` for exactly 68 bytes of
/// reply and checks them. Returns the peer's handshake on success.
pub async fn perform_handshake<S>(
    stream: &mut S,
    addr: SocketAddr,
    info_hash: [u8; 20],
    our_peer_id: [u8; 20],
    handshake_timeout: Duration,
) -> Result<Handshake>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut wire = BitTorrentWire::new();
    let peer = addr.to_string();

    debug!("Sending handshake to peer: {}", addr);
    wire.write_handshake(stream, &Handshake::new(info_hash, our_peer_id))
        .await
        .map_err(|e| TorrentError::peer_disconnected(peer.clone(), e.to_string()))?;

    let reply = timeout(handshake_timeout, wire.read_handshake(stream))
        .await
        .map_err(|_| {
            warn!("Handshake timeout from peer: {}", addr);
            TorrentError::handshake_timeout(peer.clone(), format!("no reply within {:?}", handshake_timeout))
        })?
        .map_err(|e| {
            debug!("Short handshake from {}: {}", addr, e);
            TorrentError::handshake_timeout(peer.clone(), e.to_string())
        })?;

    reply.verify(&info_hash, &peer)?;
    Ok(reply)
}

/// Writer side of a connected peer, with the connection state it drives
pub struct PeerConnection {
    /// Peer information
    pub peer: Peer,
    writer: OwnedWriteHalf,
    wire: BitTorrentWire,
    /// Requests sent and not yet answered, keyed by (piece index, begin)
    pending: HashSet<(u32, u32)>,
}

/// Reader side of a connected peer
pub struct MessageReader {
    addr: SocketAddr,
    reader: OwnedReadHalf,
    wire: BitTorrentWire,
    idle_timeout: Duration,
}

impl PeerConnection {
    /// Connect to a peer at the given address and perform handshake
    pub async fn connect(
        addr: SocketAddr,
        info_hash: [u8; 20],
        our_peer_id: [u8; 20],
        piece_count: usize,
        config: &DownloadConfig,
    ) -> Result<(Self, MessageReader)> {
        let mut peer = Peer::new(addr, piece_count);
        info!("Connecting to peer: {}", addr);

        let mut stream = timeout(config.connect_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| {
                debug!("Connection timeout to {}", addr);
                TorrentError::connect_failed(addr.to_string(), "connection timed out")
            })?
            .map_err(|e| {
                debug!("Failed to connect to {}: {}", addr, e);
                TorrentError::connect_failed(addr.to_string(), e.to_string())
            })?;

        peer.set_state(ConnectionState::HandshakeSent);
        let reply = perform_handshake(&mut stream, addr, info_hash, our_peer_id, config.handshake_timeout()).await?;

        peer.peer_id = Some(reply.peer_id);
        peer.set_state(ConnectionState::HandshakeVerified);
        info!("Handshake completed with peer {} ({})", addr, hex::encode(reply.peer_id));

        let (reader, writer) = stream.into_split();
        let connection = Self {
            peer,
            writer,
            wire: BitTorrentWire::new(),
            pending: HashSet::new(),
        };
        let reader = MessageReader {
            addr,
            reader,
            wire: BitTorrentWire::new(),
            idle_timeout: config.idle_timeout(),
        };

        Ok((connection, reader))
    }

    /// Get the peer's address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer.addr
    }

    /// Send a message to the peer
    pub async fn send_message(&mut self, message: &Message) -> Result<()> {
        trace!("Sending {:?} message to peer: {}", message.message_id(), self.peer.addr);
        self.wire
            .write_message(&mut self.writer, message)
            .await
            .map_err(|e| TorrentError::peer_disconnected(self.peer.addr.to_string(), e.to_string()).into())
    }

    /// Send interested message to the peer
    pub async fn send_interested(&mut self) -> Result<()> {
        debug!("Sending Interested to peer: {}", self.peer.addr);
        self.send_message(&Message::Interested).await?;
        self.peer.am_interested = true;
        Ok(())
    }

    /// Send keep-alive message to the peer
    pub async fn send_keepalive(&mut self) -> Result<()> {
        trace!("Sending KeepAlive to peer: {}", self.peer.addr);
        self.send_message(&Message::KeepAlive).await
    }

    /// Request a block and remember it for matching the reply
    pub async fn request_block(&mut self, block: &BlockRequest) -> Result<()> {
        if !self.peer.can_request() {
            return Err(TorrentError::protocol_violation_with_peer(
                "request while choked or not interested",
                self.peer.addr.to_string(),
            )
            .into());
        }

        trace!(
            "Requesting piece {} offset {} ({} bytes) from {}",
            block.piece_index,
            block.begin,
            block.length,
            self.peer.addr
        );
        self.send_message(&Message::Request {
            index: block.piece_index,
            begin: block.begin,
            length: block.length,
        })
        .await?;
        self.pending.insert((block.piece_index, block.begin));
        Ok(())
    }

    /// The peer choked us; it will not answer outstanding requests
    pub fn on_choke(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        self.peer.peer_choking = true;
        self.peer.set_state(ConnectionState::Choked);
        dropped
    }

    pub fn on_unchoke(&mut self) {
        self.peer.peer_choking = false;
        self.peer.set_state(ConnectionState::Unchoked);
    }

    /// Replace the claimed pieces with a validated bitfield
    pub fn on_bitfield(&mut self, bytes: &[u8]) -> Result<&Bitfield> {
        self.peer.bitfield = Bitfield::from_bytes(bytes, self.peer.bitfield.piece_count())?;
        Ok(&self.peer.bitfield)
    }

    pub fn on_have(&mut self, piece_index: u32) -> Result<()> {
        self.peer.bitfield.set(piece_index)
    }

    /// Match a `piece` message against outstanding requests, consuming the match
    pub fn take_pending(&mut self, piece_index: u32, begin: u32) -> bool {
        let matched = self.pending.remove(&(piece_index, begin));
        if matched {
            self.peer.blocks_received += 1;
        }
        matched
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Close the connection
    pub async fn close(&mut self) {
        debug!("Closing connection to peer: {}", self.peer.addr);
        self.pending.clear();
        self.peer.set_state(ConnectionState::Closed);
        let _ = self.writer.shutdown().await;
    }
}

impl MessageReader {
    /// Read the next message, failing after `idle_timeout` of silence
    pub async fn next_message(&mut self) -> Result<Message> {
        match timeout(self.idle_timeout, self.wire.read_message(&mut self.reader)).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(e)) => Err(peer_error(e, self.addr).into()),
            Err(_) => Err(TorrentError::IdleTimeout {
                peer: self.addr.to_string(),
                idle_secs: self.idle_timeout.as_secs(),
            }
            .into()),
        }
    }

    /// Forward messages into `tx` until the first error or until the receiver is dropped.
    ///
    /// Runs as its own task so that partially read frames are never dropped
    /// by a `select!` in the session loop.
    pub async fn forward(mut self, tx: mpsc::Sender<Result<Message>>) {
        loop {
            let result = self.next_message().await;
            let failed = result.is_err();
            if tx.send(result).await.is_err() || failed {
                break;
            }
        }
        trace!("Reader for {} stopped", self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn kind_of<T>(result: Result<T>) -> ErrorKind {
        match result {
            Ok(_) => panic!("expected an error"),
            Err(e) => e.downcast_ref::<TorrentError>().unwrap().kind(),
        }
    }

    fn test_config() -> DownloadConfig {
        DownloadConfig {
            connect_timeout_secs: 2,
            handshake_timeout_secs: 1,
            idle_timeout_secs: 1,
            ..DownloadConfig::default()
        }
    }

    /// Accept one connection, read our handshake and answer with `reply`
    async fn answering_peer(reply: [u8; 68]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 68];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&reply).await.unwrap();
            // keep the socket open until the client hangs up
            let mut rest = Vec::new();
            let _ = socket.read_to_end(&mut rest).await;
        });
        addr
    }

    #[tokio::test]
    async fn test_handshake_over_duplex() {
        let (mut ours, mut theirs) = tokio::io::duplex(256);
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();

        let remote = tokio::spawn(async move {
            let mut buf = [0u8; 68];
            theirs.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf[48..68], &[2u8; 20]);
            theirs.write_all(&Handshake::new([1u8; 20], [5u8; 20]).serialize()).await.unwrap();
        });

        let reply = perform_handshake(&mut ours, addr, [1u8; 20], [2u8; 20], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.peer_id, [5u8; 20]);
        remote.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_short_reply_times_out() {
        let (mut ours, mut theirs) = tokio::io::duplex(256);
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 68];
            theirs.read_exact(&mut buf).await.unwrap();
            theirs.write_all(&[19u8; 30]).await.unwrap();
        });

        let result = perform_handshake(&mut ours, addr, [1u8; 20], [2u8; 20], Duration::from_millis(200)).await;
        assert_eq!(kind_of(result), ErrorKind::HandshakeTimeout);
    }

    #[tokio::test]
    async fn test_connect_and_verify() {
        let addr = answering_peer(Handshake::new([1u8; 20], [7u8; 20]).serialize()).await;
        let (connection, _reader) = PeerConnection::connect(addr, [1u8; 20], [2u8; 20], 4, &test_config())
            .await
            .unwrap();
        assert_eq!(connection.peer.peer_id, Some([7u8; 20]));
        assert_eq!(connection.peer.state, ConnectionState::HandshakeVerified);
    }

    #[tokio::test]
    async fn test_connect_rejects_wrong_info_hash() {
        let addr = answering_peer(Handshake::new([9u8; 20], [7u8; 20]).serialize()).await;
        let result = PeerConnection::connect(addr, [1u8; 20], [2u8; 20], 4, &test_config()).await;
        assert_eq!(kind_of(result), ErrorKind::HandshakeRejected);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = PeerConnection::connect(addr, [1u8; 20], [2u8; 20], 4, &test_config()).await;
        assert_eq!(kind_of(result), ErrorKind::ConnectFailed);
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let addr = answering_peer(Handshake::new([1u8; 20], [7u8; 20]).serialize()).await;
        let (_connection, mut reader) = PeerConnection::connect(addr, [1u8; 20], [2u8; 20], 4, &test_config())
            .await
            .unwrap();
        assert_eq!(kind_of(reader.next_message().await), ErrorKind::IdleTimeout);
    }

    #[tokio::test]
    async fn test_choke_drops_pending() {
        let addr = answering_peer(Handshake::new([1u8; 20], [7u8; 20]).serialize()).await;
        let (mut connection, _reader) = PeerConnection::connect(addr, [1u8; 20], [2u8; 20], 4, &test_config())
            .await
            .unwrap();

        connection.on_bitfield(&[0b1111_0000]).unwrap();
        connection.send_interested().await.unwrap();
        connection.on_unchoke();

        let block = BlockRequest { piece_index: 2, begin: 0, length: 16384 };
        connection.request_block(&block).await.unwrap();
        assert_eq!(connection.pending_count(), 1);

        assert_eq!(connection.on_choke(), 1);
        assert!(!connection.take_pending(2, 0));
        assert_eq!(kind_of(connection.request_block(&block).await), ErrorKind::ProtocolViolation);
    }
}
