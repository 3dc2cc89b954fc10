use clap::Parser;
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_PATH;

#[derive(Debug, Parser)]
#[command(name = "bucket-validator")]
#[command(about = "Probe candidate storage buckets through a pool of zgrab2 workers")]
pub struct Cli {
    /// Listener configuration file (TOML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Override the directory result files are written to
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Override the persisted seen-set location
    #[arg(long)]
    pub seen_set: Option<PathBuf>,

    /// Write logs here instead of the default log location
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Delete every queued job and exit
    #[arg(long)]
    pub drain_queue: bool,
}

impl Cli {
    /// Config path to load and whether it was given explicitly.
    pub fn config_path(&self) -> (PathBuf, bool) {
        match &self.config {
            Some(path) => (path.clone(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        }
    }
}

pub fn parse() -> Cli {
    Cli::parse()
}
