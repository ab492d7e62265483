//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// CLI arguments for the torrent client
#[derive(Debug, Parser)]
#[command(name = "rust-torrent-core")]
#[command(about = "Bencode inspection, peer handshakes and verified single-file downloads", long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// JSON file with download settings
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Port reported to the tracker
    #[arg(short, long, global = true)]
    pub port: Option<u16>,

    /// Maximum number of peer connections
    #[arg(short, long, global = true)]
    pub max_connections: Option<usize>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Decode a bencoded value and print it as JSON
    Decode {
        /// Bencoded text, e.g. `d3:foo3:bare`
        value: String,
    },
    /// Print the metadata of a .torrent file
    Info {
        torrent: PathBuf,
    },
    /// Announce to the tracker and list the peers it returns
    Peers {
        torrent: PathBuf,
    },
    /// Handshake with one peer and print its peer id
    Handshake {
        torrent: PathBuf,
        /// Peer address as ip:port
        peer: String,
    },
    /// Download the torrent's file
    Download {
        torrent: PathBuf,

        /// Output file (defaults to the torrent's name)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,

        /// Connect to these peers instead of asking the tracker
        #[arg(long, value_name = "IP:PORT")]
        peer: Vec<String>,
    },
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}
