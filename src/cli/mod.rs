//! CLI module
//!
//! Argument parsing, configuration merging and progress output for the binary.

pub mod args;
pub mod config;
pub mod progress;

pub use args::{CliArgs, Command};
pub use config::Config;
pub use progress::ProgressDisplay;
