//! Per-peer session task
//!
//! Each connected peer runs in its own task. The task owns the socket and
//! reports everything the piece scheduler needs as `PeerEvent`s; it never
//! touches piece state directly. Block assignments come back through a
//! oneshot reply to `PeerEvent::NeedBlocks`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant};
use tracing::{debug, trace};

use crate::download::DownloadConfig;
use crate::error::TorrentError;
use crate::peer::{peer_error, Bitfield, PeerConnection};
use crate::protocol::Message;
use crate::storage::BlockRequest;

/// Buffered messages between the reader task and the session loop
const READER_QUEUE: usize = 16;

/// Something a session reports to the orchestrator
#[derive(Debug)]
pub enum PeerEvent {
    /// Handshake verified
    Connected { addr: SocketAddr, peer_id: [u8; 20] },
    /// Full set of claimed pieces
    Bitfield { addr: SocketAddr, bitfield: Bitfield },
    Have { addr: SocketAddr, piece_index: u32 },
    /// Outstanding requests to this peer were dropped
    Choked { addr: SocketAddr },
    Unchoked { addr: SocketAddr },
    /// The peer can take up to `slots` more requests
    NeedBlocks {
        addr: SocketAddr,
        slots: usize,
        reply: oneshot::Sender<Vec<BlockRequest>>,
    },
    /// A `piece` message matching one of our requests
    BlockReceived {
        addr: SocketAddr,
        piece_index: u32,
        begin: u32,
        data: Vec<u8>,
    },
    /// The session ended; `error` is `None` on a requested shutdown
    Closed { addr: SocketAddr, error: Option<TorrentError> },
}

impl PeerEvent {
    pub fn addr(&self) -> SocketAddr {
        match self {
            PeerEvent::Connected { addr, .. }
            | PeerEvent::Bitfield { addr, .. }
            | PeerEvent::Have { addr, .. }
            | PeerEvent::Choked { addr }
            | PeerEvent::Unchoked { addr }
            | PeerEvent::NeedBlocks { addr, .. }
            | PeerEvent::BlockReceived { addr, .. }
            | PeerEvent::Closed { addr, .. } => *addr,
        }
    }
}

/// What every session of one download shares
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub piece_count: usize,
    pub config: Arc<DownloadConfig>,
}

/// Connect to `addr` and run the session until it fails or `shutdown` flips.
///
/// Always finishes by sending exactly one `PeerEvent::Closed`. A change on
/// `work` means blocks were re-queued somewhere and idle peers should ask again.
pub async fn run_session(
    addr: SocketAddr,
    ctx: SessionContext,
    events: mpsc::Sender<PeerEvent>,
    mut shutdown: watch::Receiver<bool>,
    work: watch::Receiver<u64>,
) {
    let connected = tokio::select! {
        biased;
        _ = shutdown.changed() => {
            let _ = events.send(PeerEvent::Closed { addr, error: None }).await;
            return;
        }
        result = PeerConnection::connect(addr, ctx.info_hash, ctx.peer_id, ctx.piece_count, &ctx.config) => result,
    };

    let (mut conn, reader) = match connected {
        Ok(pair) => pair,
        Err(e) => {
            let error = peer_error(e, addr);
            debug!("Connection to {} failed: {}", addr, error);
            let _ = events.send(PeerEvent::Closed { addr, error: Some(error) }).await;
            return;
        }
    };

    let (msg_tx, msg_rx) = mpsc::channel(READER_QUEUE);
    let reader_task = tokio::spawn(reader.forward(msg_tx));

    let outcome = drive(&mut conn, msg_rx, &ctx, &events, shutdown, work).await;

    reader_task.abort();
    if conn.pending_count() > 0 {
        debug!("Dropping {} unanswered requests to {}", conn.pending_count(), addr);
    }
    conn.close().await;

    let error = outcome.err().map(|e| peer_error(e, addr));
    match &error {
        Some(e) => debug!("Session with {} closed: {}", addr, e),
        None => debug!("Session with {} stopped", addr),
    }
    let _ = events.send(PeerEvent::Closed { addr, error }).await;
}

async fn drive(
    conn: &mut PeerConnection,
    mut messages: mpsc::Receiver<Result<Message>>,
    ctx: &SessionContext,
    events: &mpsc::Sender<PeerEvent>,
    mut shutdown: watch::Receiver<bool>,
    mut work: watch::Receiver<u64>,
) -> Result<()> {
    let addr = conn.peer_addr();
    emit(
        events,
        addr,
        PeerEvent::Connected {
            addr,
            peer_id: conn.peer.peer_id.unwrap_or_default(),
        },
    )
    .await?;

    let period = ctx.config.keepalive_interval();
    let mut keepalive = interval_at(Instant::now() + period, period);
    let mut wants_work = false;

    loop {
        if wants_work && conn.peer.can_request() {
            wants_work = false;
            let blocks = request_work(events, addr, ctx.config.max_outstanding_requests).await?;
            for block in &blocks {
                conn.request_block(block).await?;
            }
        }

        tokio::select! {
            biased;
            _ = shutdown.changed() => return Ok(()),
            message = messages.recv() => {
                let message = match message {
                    Some(message) => message?,
                    None => return Err(TorrentError::peer_disconnected(addr.to_string(), "reader stopped").into()),
                };
                if handle_message(conn, message, events).await? {
                    wants_work = true;
                }
            }
            changed = work.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                wants_work = true;
            }
            _ = keepalive.tick() => conn.send_keepalive().await?,
        }
    }
}

/// Apply one message to the connection; returns true if the peer may now take more requests
async fn handle_message(conn: &mut PeerConnection, message: Message, events: &mpsc::Sender<PeerEvent>) -> Result<bool> {
    let addr = conn.peer_addr();
    match message {
        Message::KeepAlive => {
            trace!("KeepAlive from {}", addr);
            Ok(false)
        }
        Message::Choke => {
            let dropped = conn.on_choke();
            debug!("Choked by {} ({} requests dropped)", addr, dropped);
            emit(events, addr, PeerEvent::Choked { addr }).await?;
            Ok(false)
        }
        Message::Unchoke => {
            debug!("Unchoked by {}", addr);
            conn.on_unchoke();
            emit(events, addr, PeerEvent::Unchoked { addr }).await?;
            Ok(true)
        }
        Message::Interested => {
            conn.peer.peer_interested = true;
            Ok(false)
        }
        Message::NotInterested => {
            conn.peer.peer_interested = false;
            Ok(false)
        }
        Message::Have { piece_index } => {
            conn.on_have(piece_index)?;
            trace!("{} has piece {}", addr, piece_index);
            ensure_interested(conn).await?;
            emit(events, addr, PeerEvent::Have { addr, piece_index }).await?;
            Ok(true)
        }
        Message::Bitfield { bitfield } => {
            let bitfield = conn.on_bitfield(&bitfield)?.clone();
            debug!("{} advertises {}/{} pieces", addr, bitfield.count(), bitfield.piece_count());
            if !bitfield.is_empty() {
                ensure_interested(conn).await?;
            }
            emit(events, addr, PeerEvent::Bitfield { addr, bitfield }).await?;
            Ok(true)
        }
        Message::Piece { index, begin, block } => {
            if !conn.take_pending(index, begin) {
                trace!("Discarding unrequested block {}:{} from {}", index, begin, addr);
                return Ok(false);
            }
            emit(
                events,
                addr,
                PeerEvent::BlockReceived {
                    addr,
                    piece_index: index,
                    begin,
                    data: block,
                },
            )
            .await?;
            Ok(true)
        }
        Message::Request { index, begin, .. } | Message::Cancel { index, begin, .. } => {
            trace!("Ignoring upload request {}:{} from {}", index, begin, addr);
            Ok(false)
        }
        Message::Unknown { id, payload_len } => {
            debug!("Ignoring unknown message id {} ({} bytes) from {}", id, payload_len, addr);
            Ok(false)
        }
    }
}

async fn ensure_interested(conn: &mut PeerConnection) -> Result<()> {
    if !conn.peer.am_interested {
        conn.send_interested().await?;
    }
    Ok(())
}

async fn request_work(events: &mpsc::Sender<PeerEvent>, addr: SocketAddr, slots: usize) -> Result<Vec<BlockRequest>> {
    let (reply, response) = oneshot::channel();
    emit(events, addr, PeerEvent::NeedBlocks { addr, slots, reply }).await?;
    response
        .await
        .map_err(|_| TorrentError::peer_disconnected(addr.to_string(), "download stopped").into())
}

async fn emit(events: &mpsc::Sender<PeerEvent>, addr: SocketAddr, event: PeerEvent) -> Result<()> {
    events
        .send(event)
        .await
        .map_err(|_| TorrentError::peer_disconnected(addr.to_string(), "download stopped").into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BitTorrentWire, Handshake, WireProtocol};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const INFO_HASH: [u8; 20] = [7u8; 20];

    fn context() -> SessionContext {
        SessionContext {
            info_hash: INFO_HASH,
            peer_id: *b"-RC0001-000000000000",
            piece_count: 1,
            config: Arc::new(DownloadConfig {
                connect_timeout_secs: 2,
                handshake_timeout_secs: 2,
                ..Default::default()
            }),
        }
    }

    /// Accept one connection, answer the handshake, send `opening`, then
    /// report every message received until the socket closes.
    async fn serve_peer(opening: Vec<Message>) -> (SocketAddr, mpsc::Receiver<Message>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut wire = BitTorrentWire::new();
            let theirs = wire.read_handshake(&mut stream).await.unwrap();
            let reply = Handshake::new(theirs.info_hash, *b"-XX0001-remote-peer!");
            wire.write_handshake(&mut stream, &reply).await.unwrap();
            for message in &opening {
                wire.write_message(&mut stream, message).await.unwrap();
            }
            while let Ok(message) = wire.read_message(&mut stream).await {
                if let Message::Request { index, begin, length } = message {
                    let block = vec![0xAB; length as usize];
                    wire.write_message(&mut stream, &Message::Piece { index, begin, block }).await.unwrap();
                }
                if tx.send(message).await.is_err() {
                    break;
                }
            }
        });

        (addr, rx)
    }

    async fn next_event(rx: &mut mpsc::Receiver<PeerEvent>) -> PeerEvent {
        timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_session_requests_after_unchoke() {
        let (addr, mut seen) = serve_peer(vec![Message::Bitfield { bitfield: vec![0x80] }, Message::Unchoke]).await;
        let (events_tx, mut events) = mpsc::channel(32);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (_work_tx, work_rx) = watch::channel(0u64);

        let task = tokio::spawn(run_session(addr, context(), events_tx, shutdown_rx, work_rx));

        assert!(matches!(next_event(&mut events).await, PeerEvent::Connected { peer_id, .. } if &peer_id[..8] == b"-XX0001-"));
        match next_event(&mut events).await {
            PeerEvent::Bitfield { bitfield, .. } => assert!(bitfield.has(0)),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(next_event(&mut events).await, PeerEvent::Unchoked { .. }));

        match next_event(&mut events).await {
            PeerEvent::NeedBlocks { slots, reply, .. } => {
                assert_eq!(slots, 5);
                reply
                    .send(vec![BlockRequest { piece_index: 0, begin: 0, length: 16384 }])
                    .unwrap();
            }
            other => panic!("unexpected event {:?}", other),
        }

        match next_event(&mut events).await {
            PeerEvent::BlockReceived { piece_index, begin, data, .. } => {
                assert_eq!((piece_index, begin), (0, 0));
                assert_eq!(data.len(), 16384);
            }
            other => panic!("unexpected event {:?}", other),
        }

        assert_eq!(seen.recv().await, Some(Message::Interested));
        assert_eq!(
            seen.recv().await,
            Some(Message::Request { index: 0, begin: 0, length: 16384 })
        );

        // Asks for more work after the block, then stops on shutdown
        assert!(matches!(next_event(&mut events).await, PeerEvent::NeedBlocks { .. }));
        shutdown_tx.send_replace(true);
        loop {
            if let PeerEvent::Closed { error, .. } = next_event(&mut events).await {
                assert!(error.is_none() || error.as_ref().map(|e| e.kind()) == Some(crate::error::ErrorKind::PeerDisconnected));
                break;
            }
        }
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_session_without_pieces_never_requests() {
        let (addr, mut seen) = serve_peer(vec![Message::Unchoke]).await;
        let (events_tx, mut events) = mpsc::channel(32);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (work_tx, work_rx) = watch::channel(0u64);

        let task = tokio::spawn(run_session(addr, context(), events_tx, shutdown_rx, work_rx));

        assert!(matches!(next_event(&mut events).await, PeerEvent::Connected { .. }));
        assert!(matches!(next_event(&mut events).await, PeerEvent::Unchoked { .. }));

        work_tx.send(1).unwrap();
        let quiet = timeout(Duration::from_millis(300), events.recv()).await;
        assert!(quiet.is_err(), "session produced an event without any advertised piece");

        shutdown_tx.send_replace(true);
        assert!(matches!(next_event(&mut events).await, PeerEvent::Closed { error: None, .. }));
        task.await.unwrap();

        while let Ok(Some(message)) = timeout(Duration::from_millis(200), seen.recv()).await {
            assert!(!matches!(message, Message::Request { .. }));
            assert_ne!(message, Message::Interested);
        }
    }

    #[tokio::test]
    async fn test_session_reports_connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (events_tx, mut events) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (_work_tx, work_rx) = watch::channel(0u64);
        run_session(addr, context(), events_tx, shutdown_rx, work_rx).await;

        match next_event(&mut events).await {
            PeerEvent::Closed { error: Some(error), .. } => assert!(!error.is_fatal()),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
