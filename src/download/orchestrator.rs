//! Download orchestrator
//!
//! Owns the `PieceManager` and the output sink. Peer sessions run as
//! separate tasks and talk to the orchestrator only through `PeerEvent`s,
//! so piece state has exactly one writer.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::download::DownloadConfig;
use crate::error::TorrentError;
use crate::peer::{run_session, PeerEvent, SessionContext};
use crate::storage::{BlockOutcome, OutputSink, PieceManager};
use crate::torrent::TorrentMetadata;
use crate::tracker::{AnnounceRequest, PeerSource};

/// Capacity of the session event channel
const EVENT_QUEUE: usize = 256;

/// Period of the housekeeping tick
const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// How long sessions get to wind down after the download ends
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Progress snapshot published while downloading
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadProgress {
    pub completed_pieces: usize,
    pub total_pieces: usize,
    pub verified_bytes: u64,
    pub total_bytes: u64,
    pub connected_peers: usize,
    pub failed_verifications: u32,
}

impl DownloadProgress {
    /// Completion in 0.0..=1.0
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return if self.completed_pieces == self.total_pieces { 1.0 } else { 0.0 };
        }
        self.verified_bytes as f64 / self.total_bytes as f64
    }

    pub fn is_complete(&self) -> bool {
        self.completed_pieces == self.total_pieces
    }
}

/// Result of a finished download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSummary {
    pub bytes: u64,
    pub pieces: usize,
    /// Peers that delivered at least one accepted block
    pub peers_used: usize,
    pub elapsed: Duration,
}

/// Connection bookkeeping for one run
#[derive(Debug, Default)]
struct PeerPool {
    queue: VecDeque<SocketAddr>,
    tried: HashSet<SocketAddr>,
    connecting: HashSet<SocketAddr>,
    live: HashSet<SocketAddr>,
    used: HashSet<SocketAddr>,
    refreshes: u32,
}

impl PeerPool {
    /// Queue addresses that are neither queued nor currently connected
    fn enqueue(&mut self, peers: Vec<SocketAddr>) -> usize {
        let mut added = 0;
        for addr in peers {
            if self.queue.contains(&addr) || self.connecting.contains(&addr) || self.live.contains(&addr) {
                continue;
            }
            self.queue.push_back(addr);
            added += 1;
        }
        added
    }

    fn in_flight(&self) -> usize {
        self.connecting.len() + self.live.len()
    }

    /// Nothing queued and nothing still connecting
    fn is_drained(&self) -> bool {
        self.queue.is_empty() && self.connecting.is_empty()
    }
}

/// Downloads one torrent into an output sink
pub struct Downloader<S: OutputSink> {
    metadata: TorrentMetadata,
    peer_id: [u8; 20],
    config: Arc<DownloadConfig>,
    peer_source: Arc<dyn PeerSource>,
    sink: S,
    progress_tx: watch::Sender<DownloadProgress>,
}

impl<S: OutputSink> Downloader<S> {
    /// Create a downloader; `peer_id` identifies us in every handshake
    pub fn new(
        metadata: TorrentMetadata,
        peer_id: [u8; 20],
        config: DownloadConfig,
        peer_source: Arc<dyn PeerSource>,
        sink: S,
    ) -> Self {
        let (progress_tx, _) = watch::channel(DownloadProgress {
            total_pieces: metadata.piece_count(),
            total_bytes: metadata.total_length,
            ..Default::default()
        });

        Self {
            metadata,
            peer_id,
            config: Arc::new(config),
            peer_source,
            sink,
            progress_tx,
        }
    }

    /// Subscribe to progress updates
    pub fn progress(&self) -> watch::Receiver<DownloadProgress> {
        self.progress_tx.subscribe()
    }

    /// Run until every piece is verified and persisted, or a fatal error occurs
    pub async fn run(mut self) -> Result<DownloadSummary> {
        self.config.validate()?;
        let started = Instant::now();
        let mut pieces = PieceManager::new(&self.metadata, &self.config);

        info!(
            "Starting download of '{}' ({} bytes, {} pieces)",
            self.metadata.name,
            self.metadata.total_length,
            pieces.piece_count()
        );

        if pieces.is_complete() {
            self.sink.flush().await?;
            return Ok(DownloadSummary {
                bytes: 0,
                pieces: 0,
                peers_used: 0,
                elapsed: started.elapsed(),
            });
        }

        let announce = AnnounceRequest::started(
            self.metadata.announce.clone(),
            self.metadata.info_hash,
            self.peer_id,
            self.config.listen_port,
            self.metadata.total_length,
        );

        let mut pool = PeerPool::default();
        let found = self.fetch_peers(&announce).await;
        pool.enqueue(found);

        let ctx = SessionContext {
            info_hash: self.metadata.info_hash,
            peer_id: self.peer_id,
            piece_count: pieces.piece_count(),
            config: self.config.clone(),
        };

        let (events_tx, mut events_rx) = mpsc::channel(EVENT_QUEUE);
        let (shutdown_tx, _) = watch::channel(false);
        let (work_tx, _) = watch::channel(0u64);
        let mut sessions = JoinSet::new();

        let mut tick = interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stalled_since: Option<Instant> = None;

        let outcome: Result<()> = loop {
            while pool.in_flight() < self.config.max_connections {
                let Some(addr) = pool.queue.pop_front() else { break };
                pool.tried.insert(addr);
                pool.connecting.insert(addr);
                debug!("Spawning session for {}", addr);
                sessions.spawn(run_session(
                    addr,
                    ctx.clone(),
                    events_tx.clone(),
                    shutdown_tx.subscribe(),
                    work_tx.subscribe(),
                ));
            }

            tokio::select! {
                event = events_rx.recv() => {
                    let Some(event) = event else {
                        break Err(TorrentError::protocol_violation("session event channel closed").into());
                    };
                    if let Err(e) = self.handle_event(event, &mut pieces, &mut pool, &work_tx).await {
                        break Err(e);
                    }
                    if pieces.is_complete() {
                        break Ok(());
                    }
                }
                joined = sessions.join_next(), if !sessions.is_empty() => {
                    if let Some(Err(e)) = joined {
                        if e.is_panic() {
                            error!("Peer session panicked: {}", e);
                        }
                    }
                }
                _ = tick.tick() => {
                    if pieces.reclaim_stale_requests(self.config.request_timeout()) > 0 {
                        bump(&work_tx);
                    }

                    let starving = pool.is_drained() && (pool.live.is_empty() || pieces.missing_without_provider() > 0);
                    if !starving {
                        stalled_since = None;
                        continue;
                    }

                    let since = *stalled_since.get_or_insert_with(Instant::now);
                    let patience = if pool.live.is_empty() {
                        self.config.peer_refresh_delay()
                    } else {
                        self.config.idle_timeout()
                    };
                    if since.elapsed() < patience {
                        continue;
                    }

                    if pool.refreshes >= self.config.max_peer_refreshes {
                        let missing = pieces.missing_pieces();
                        error!("No peers left for {} missing pieces after trying {}", missing, pool.tried.len());
                        break Err(TorrentError::NoPeersAvailable {
                            missing_pieces: missing,
                            peers_tried: pool.tried.len(),
                        }
                        .into());
                    }

                    pool.refreshes += 1;
                    stalled_since = None;
                    info!("Refreshing peer list ({}/{})", pool.refreshes, self.config.max_peer_refreshes);
                    let found = self.fetch_peers(&self.reannounce(&pieces)).await;
                    let added = pool.enqueue(found);
                    debug!("Refresh queued {} peers", added);
                }
            }
        };

        shutdown_tx.send_replace(true);
        drop(events_rx);
        if timeout(SHUTDOWN_GRACE, async { while sessions.join_next().await.is_some() {} })
            .await
            .is_err()
        {
            warn!("Aborting {} peer sessions that did not stop in time", sessions.len());
            sessions.shutdown().await;
        }

        if let Err(e) = outcome {
            error!("Download failed: {}", e);
            return Err(e);
        }

        self.sink.flush().await?;
        let progress = pieces.progress();
        let summary = DownloadSummary {
            bytes: progress.verified_bytes,
            pieces: progress.completed_pieces,
            peers_used: pool.used.len(),
            elapsed: started.elapsed(),
        };
        info!(
            "Download complete: {} bytes in {} pieces from {} peers ({:?})",
            summary.bytes, summary.pieces, summary.peers_used, summary.elapsed
        );
        Ok(summary)
    }

    /// Announce carrying the bytes verified so far
    fn reannounce(&self, pieces: &PieceManager) -> AnnounceRequest {
        let progress = pieces.progress();
        AnnounceRequest::progress(
            self.metadata.announce.clone(),
            self.metadata.info_hash,
            self.peer_id,
            self.config.listen_port,
            progress.verified_bytes,
            progress.total_bytes.saturating_sub(progress.verified_bytes),
        )
    }

    /// Ask the peer source for addresses; failures are logged and yield none
    async fn fetch_peers(&self, announce: &AnnounceRequest) -> Vec<SocketAddr> {
        match self.peer_source.fetch_peers(announce).await {
            Ok(peers) => {
                info!("Peer source returned {} peers", peers.len());
                peers
            }
            Err(e) => {
                warn!("Failed to fetch peers: {}", e);
                Vec::new()
            }
        }
    }

    async fn handle_event(
        &mut self,
        event: PeerEvent,
        pieces: &mut PieceManager,
        pool: &mut PeerPool,
        work_tx: &watch::Sender<u64>,
    ) -> Result<()> {
        match event {
            PeerEvent::Connected { addr, peer_id } => {
                debug!("Peer {} connected ({})", addr, hex::encode(peer_id));
                pool.connecting.remove(&addr);
                pool.live.insert(addr);
                pieces.register_peer(addr);
                self.publish(pieces, pool);
            }
            PeerEvent::Bitfield { addr, bitfield } => pieces.on_bitfield(addr, bitfield),
            PeerEvent::Have { addr, piece_index } => pieces.on_have(addr, piece_index),
            PeerEvent::Choked { addr } => {
                if pieces.on_peer_choked(addr) > 0 {
                    bump(work_tx);
                }
            }
            PeerEvent::Unchoked { addr } => pieces.on_peer_unchoked(addr),
            PeerEvent::NeedBlocks { addr, slots, reply } => {
                let blocks = pieces.next_blocks_for(addr, slots);
                // the session may already be gone
                let _ = reply.send(blocks);
            }
            PeerEvent::BlockReceived {
                addr,
                piece_index,
                begin,
                data,
            } => match pieces.on_block_received(addr, piece_index, begin, &data)? {
                BlockOutcome::Accepted => {
                    pool.used.insert(addr);
                }
                BlockOutcome::PieceVerified(piece) => {
                    pool.used.insert(addr);
                    self.sink.write_at(piece.offset, &piece.data).await?;
                    pieces.mark_complete(piece.index);
                    self.publish(pieces, pool);
                }
                BlockOutcome::HashMismatch { piece_index, attempt } => {
                    debug!("Piece {} re-queued after failed verification {}", piece_index, attempt);
                    bump(work_tx);
                    self.publish(pieces, pool);
                }
                BlockOutcome::Rejected => bump(work_tx),
                BlockOutcome::Duplicate => {}
            },
            PeerEvent::Closed { addr, error } => {
                pool.connecting.remove(&addr);
                pool.live.remove(&addr);
                match error {
                    Some(e) => debug!("Peer {} closed: {}", addr, e),
                    None => debug!("Peer {} closed", addr),
                }
                if pieces.on_connection_lost(addr) > 0 {
                    bump(work_tx);
                }
                self.publish(pieces, pool);
            }
        }
        Ok(())
    }

    fn publish(&self, pieces: &PieceManager, pool: &PeerPool) {
        let progress = pieces.progress();
        self.progress_tx.send_replace(DownloadProgress {
            completed_pieces: progress.completed_pieces,
            total_pieces: progress.total_pieces,
            verified_bytes: progress.verified_bytes,
            total_bytes: progress.total_bytes,
            connected_peers: pool.live.len(),
            failed_verifications: progress.failed_verifications,
        });
    }
}

/// Wake idle sessions so they ask for work again
fn bump(work_tx: &watch::Sender<u64>) {
    work_tx.send_modify(|generation| *generation = generation.wrapping_add(1));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{encode, BencodeValue};
    use crate::error::ErrorKind;
    use crate::storage::MemorySink;
    use crate::tracker::StaticPeers;
    use sha1::{Digest, Sha1};

    fn metadata_for(data: &[u8], piece_length: usize) -> TorrentMetadata {
        let pieces: Vec<u8> = data
            .chunks(piece_length)
            .flat_map(|chunk| <[u8; 20]>::from(Sha1::digest(chunk)))
            .collect();
        let torrent = BencodeValue::dict([
            ("announce", BencodeValue::from("http://tracker.invalid/announce")),
            (
                "info",
                BencodeValue::dict([
                    ("name", BencodeValue::from("sample.bin")),
                    ("length", BencodeValue::Integer(data.len() as i64)),
                    ("piece length", BencodeValue::Integer(piece_length as i64)),
                    ("pieces", BencodeValue::Bytes(pieces)),
                ]),
            ),
        ]);
        TorrentMetadata::parse(&encode(&torrent)).unwrap()
    }

    fn fast_config() -> DownloadConfig {
        DownloadConfig {
            connect_timeout_secs: 1,
            handshake_timeout_secs: 1,
            idle_timeout_secs: 1,
            peer_refresh_delay_secs: 1,
            max_peer_refreshes: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_progress_fraction() {
        let progress = DownloadProgress {
            completed_pieces: 1,
            total_pieces: 4,
            verified_bytes: 25,
            total_bytes: 100,
            ..Default::default()
        };
        assert!((progress.fraction() - 0.25).abs() < f64::EPSILON);
        assert!(!progress.is_complete());
    }

    #[test]
    fn test_peer_pool_enqueue_skips_known() {
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:2".parse().unwrap();
        let mut pool = PeerPool::default();
        pool.live.insert(a);

        assert_eq!(pool.enqueue(vec![a, b, b]), 1);
        assert_eq!(pool.queue, VecDeque::from(vec![b]));
        assert!(!pool.is_drained());
    }

    #[tokio::test]
    async fn test_no_peers_fails_after_refreshes() {
        let metadata = metadata_for(&[1u8; 100], 64);
        let downloader = Downloader::new(
            metadata,
            [9u8; 20],
            fast_config(),
            Arc::new(StaticPeers::default()),
            MemorySink::new(),
        );

        let err = downloader.run().await.unwrap_err();
        match err.downcast_ref::<TorrentError>().unwrap() {
            TorrentError::NoPeersAvailable { missing_pieces, peers_tried } => {
                assert_eq!(*missing_pieces, 2);
                assert_eq!(*peers_tried, 0);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_peers_are_not_fatal_until_exhausted() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);

        let metadata = metadata_for(&[1u8; 100], 64);
        let downloader = Downloader::new(
            metadata,
            [9u8; 20],
            fast_config(),
            Arc::new(StaticPeers::new(vec![dead])),
            MemorySink::new(),
        );

        let err = downloader.run().await.unwrap_err();
        let typed = err.downcast_ref::<TorrentError>().unwrap();
        assert_eq!(typed.kind(), ErrorKind::NoPeersAvailable);
        assert!(typed.is_fatal());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let metadata = metadata_for(&[1u8; 10], 16);
        let config = DownloadConfig {
            max_connections: 0,
            ..Default::default()
        };
        let downloader = Downloader::new(metadata, [9u8; 20], config, Arc::new(StaticPeers::default()), MemorySink::new());
        let err = downloader.run().await.unwrap_err();
        assert_eq!(err.downcast_ref::<TorrentError>().unwrap().kind(), ErrorKind::Config);
    }
}
