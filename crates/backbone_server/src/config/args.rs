//! Command-line argument parsing

use clap::Parser;
use std::path::PathBuf;

/// Command-line arguments for the event backbone node
///
/// Flags given here override the configuration file.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    ///
    /// If the file doesn't exist, a default configuration will be created.
    #[arg(short, long, default_value = "backbone.toml")]
    pub config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,

    /// Override the number of dispatcher workers
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Override the node name
    #[arg(short, long)]
    pub name: Option<String>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            config: PathBuf::from("backbone.toml"),
            debug: false,
            json_logs: false,
            workers: None,
            name: None,
        }
    }
}
