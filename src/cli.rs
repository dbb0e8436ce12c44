//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;
use url::Url;

/// Download remote asset bundles for a set of labels.
///
/// Bundle-fetch checks the remote catalog for updates, sizes every label's
/// missing bundles, asks for confirmation and downloads them into a local
/// cache with live progress.
#[derive(Parser, Debug)]
#[command(name = "bundle-fetch")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Config file (default: $XDG_CONFIG_HOME/bundle-fetch/config.toml)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Root URL serving catalog.hash, catalog.json and bundles/
    #[arg(short = 'u', long, value_name = "URL")]
    pub base_url: Option<Url>,

    /// Local cache directory for the catalog and downloaded bundles
    #[arg(short = 'd', long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Label to size and download (repeatable, order is kept)
    #[arg(short = 'l', long = "label", value_name = "LABEL")]
    pub labels: Vec<String>,

    /// JSON file listing labels: { "labels": ["env", "chars"] }
    #[arg(long, value_name = "PATH", conflicts_with = "labels")]
    pub labels_file: Option<PathBuf>,

    /// Download without asking for confirmation
    #[arg(short = 'y', long)]
    pub yes: bool,

    /// Disable the progress bar
    #[arg(long)]
    pub no_progress: bool,

    /// Disable colored log output
    #[arg(long)]
    pub no_color: bool,

    /// HTTP connect timeout in seconds (1-3600)
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..=3600))]
    pub connect_timeout: Option<u64>,

    /// HTTP read timeout in seconds (1-3600)
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..=3600))]
    pub read_timeout: Option<u64>,
}
