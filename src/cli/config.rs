//! CLI configuration module
//!
//! Merges an optional JSON settings file with command-line overrides.

use crate::cli::args::CliArgs;
use crate::download::DownloadConfig;
use crate::error::TorrentError;
use anyhow::Result;
use std::path::Path;
use tracing::debug;

/// Configuration for one CLI invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Download settings
    pub download: DownloadConfig,
    /// Verbose output
    pub verbose: bool,
    /// Quiet mode
    pub quiet: bool,
}

impl Config {
    /// Create configuration from CLI arguments; flags override file values
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let mut download = match &args.config {
            Some(path) => Self::load_file(path)?,
            None => DownloadConfig::default(),
        };

        if let Some(port) = args.port {
            download.listen_port = port;
        }
        if let Some(max_connections) = args.max_connections {
            download.max_connections = max_connections;
        }

        let config = Self {
            download,
            verbose: args.verbose,
            quiet: args.quiet,
        };
        config.validate()?;
        Ok(config)
    }

    /// Read download settings from a JSON file
    pub fn load_file(path: &Path) -> Result<DownloadConfig> {
        debug!("Loading configuration from {}", path.display());
        let text = std::fs::read_to_string(path).map_err(|e| {
            TorrentError::config_error_with_field(format!("cannot read {}: {}", path.display(), e), "config")
        })?;
        let config: DownloadConfig = serde_json::from_str(&text).map_err(TorrentError::from)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.download.validate()
    }

    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}
