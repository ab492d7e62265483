//! rust-torrent-core - Main entry point
//!
//! Inspect bencode and torrent files, talk to trackers and peers, and download.

use anyhow::{Context, Result};
use rust_torrent_core::{
    decode, perform_handshake, CliArgs, Command, Config, Downloader, FileSink, Handshake, PeerSource,
    ProgressDisplay, StaticPeers, TorrentError, TorrentMetadata, AnnounceRequest,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        match panic_info.location() {
            Some(location) => error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            ),
            None => error!("PANIC occurred at unknown location"),
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    init_logging(&args);
    debug!("CLI arguments: {:?}", args);

    let config = Config::from_args(&args).context("Invalid configuration")?;

    // Generated once per process and passed down explicitly
    let peer_id = Handshake::generate_peer_id();

    let result = match &args.command {
        Command::Decode { value } => run_decode(value),
        Command::Info { torrent } => run_info(torrent),
        Command::Peers { torrent } => run_peers(torrent, &config, peer_id).await,
        Command::Handshake { torrent, peer } => run_handshake(torrent, peer, &config, peer_id).await,
        Command::Download { torrent, output, peer } => {
            run_download(torrent, output.as_deref(), peer, &config, peer_id).await
        }
    };

    if let Err(e) = &result {
        match e.downcast_ref::<TorrentError>() {
            Some(typed) => error!("{:?} error: {}", typed.kind(), typed),
            None => error!("{:#}", e),
        }
    }
    result
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.verbose {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }

    debug!("Logging initialized with level {:?}", args.log_level());
}

fn run_decode(value: &str) -> Result<()> {
    let decoded = decode(value.as_bytes())?;
    println!("{}", serde_json::to_string(&decoded.to_json())?);
    Ok(())
}

fn run_info(path: &Path) -> Result<()> {
    let metadata = TorrentMetadata::parse_file(path)?;

    println!("Tracker URL: {}", metadata.announce);
    println!("Name: {}", metadata.name);
    println!("Length: {}", metadata.total_length);
    println!("Info Hash: {}", metadata.info_hash_hex());
    println!("Piece Length: {}", metadata.piece_length);
    println!("Piece Count: {}", metadata.piece_count());
    println!("Piece Hashes:");
    for hash in &metadata.piece_hashes {
        println!("{}", hex::encode(hash));
    }
    Ok(())
}

/// Peer source that announces to the torrent's tracker
#[cfg(feature = "download")]
fn tracker_source(config: &Config) -> Result<Arc<dyn PeerSource>> {
    let tracker = rust_torrent_core::HttpTracker::new(config.download.request_timeout())?;
    Ok(Arc::new(tracker))
}

#[cfg(not(feature = "download"))]
fn tracker_source(_config: &Config) -> Result<Arc<dyn PeerSource>> {
    Err(TorrentError::tracker_error("built without tracker support; pass --peer addresses").into())
}

async fn run_peers(path: &Path, config: &Config, peer_id: [u8; 20]) -> Result<()> {
    let metadata = TorrentMetadata::parse_file(path)?;
    let source = tracker_source(config)?;
    let request = AnnounceRequest::started(
        metadata.announce.clone(),
        metadata.info_hash,
        peer_id,
        config.download.listen_port,
        metadata.total_length,
    );

    for peer in source.fetch_peers(&request).await? {
        println!("{}", peer);
    }
    Ok(())
}

async fn run_handshake(path: &Path, peer: &str, config: &Config, peer_id: [u8; 20]) -> Result<()> {
    let metadata = TorrentMetadata::parse_file(path)?;
    let addr: SocketAddr = peer.parse().map_err(TorrentError::from)?;

    info!("Connecting to peer: {}", addr);
    let mut stream = timeout(config.download.connect_timeout(), TcpStream::connect(addr))
        .await
        .map_err(|_| TorrentError::connect_failed(addr.to_string(), "connection timed out"))?
        .map_err(|e| TorrentError::connect_failed(addr.to_string(), e.to_string()))?;

    let reply = perform_handshake(
        &mut stream,
        addr,
        metadata.info_hash,
        peer_id,
        config.download.handshake_timeout(),
    )
    .await?;

    println!("Peer ID: {}", hex::encode(reply.peer_id));
    Ok(())
}

async fn run_download(
    path: &Path,
    output: Option<&Path>,
    peers: &[String],
    config: &Config,
    peer_id: [u8; 20],
) -> Result<()> {
    let metadata = TorrentMetadata::parse_file(path)?;
    let output = output.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(&metadata.name));

    info!(
        "Downloading '{}' ({} bytes, {} pieces) to {}",
        metadata.name,
        metadata.total_length,
        metadata.piece_count(),
        output.display()
    );

    let source: Arc<dyn PeerSource> = if peers.is_empty() {
        tracker_source(config)?
    } else {
        Arc::new(StaticPeers::parse(peers)?)
    };

    let sink = FileSink::create(&output, metadata.total_length).await?;
    let downloader = Downloader::new(metadata, peer_id, config.download.clone(), source, sink);

    let follower = tokio::spawn(ProgressDisplay::new(config.is_quiet()).follow(downloader.progress()));

    let summary = downloader.run().await;
    // the downloader dropped its sender, so the follower ends on its own
    let display = follower.await.context("progress display task failed")?;

    let summary = summary?;
    display.print_complete(&summary)?;
    info!("Saved {}", output.display());
    Ok(())
}
