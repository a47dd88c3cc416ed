//! Command-line arguments

use crate::config::{Config, DEFAULT_CONFIG_FILE};
use clap::Parser;
use std::path::PathBuf;

#[derive(Clone, Debug, Parser)]
#[command(name = "sidesync", version, about = "Mirror remote mod directories into a local game install")]
pub struct Args {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Mirror from this local directory instead of the configured FTP server
    #[arg(long = "source-dir")]
    pub source_dir: Option<PathBuf>,

    /// Parallel connections (overrides connection.max_connections)
    #[arg(short = 'c', long = "connections")]
    pub connections: Option<usize>,

    /// Chunk size in MiB (overrides chunk_size_mb)
    #[arg(long = "chunk-mb")]
    pub chunk_mb: Option<u32>,

    /// Scan and compare only; nothing is deleted or downloaded
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// List every planned deletion and download
    #[arg(short, long)]
    pub verbose: bool,

    /// Write timestamped event lines to this file
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Print the run report as JSON instead of text
    #[arg(long)]
    pub json: bool,
}

impl Args {
    /// Fold command-line overrides into `config` and re-validate.
    pub fn apply(&self, config: &mut Config) -> crate::error::Result<()> {
        if let Some(n) = self.connections {
            config.connection.max_connections = n;
        }
        if let Some(mb) = self.chunk_mb {
            config.chunk_size_mb = mb;
        }
        config.validate()
    }
}
