//! CLI entry point for bundle-fetch.

use std::io::{self, IsTerminal};

use anyhow::Result;
use clap::Parser;
use tracing::{debug, info};

mod app;
mod cli;

use app::{RunOutcome, config, progress::format_size, terminal};
use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    let loaded = config::load_config(args.config.as_deref())?;
    let file = loaded.config_or_default();

    let no_color = terminal::should_disable_color(
        args.no_color,
        terminal::no_color_env_requested(),
        terminal::is_dumb_terminal(),
    );
    terminal::init_tracing(app::log_level(&args, &file), no_color);

    debug!(
        ?args,
        config = ?loaded.path,
        loaded_from_file = loaded.loaded_from_file,
        "CLI arguments parsed"
    );

    let settings = app::resolve_settings(&args, &loaded, io::stderr().is_terminal())?;
    info!("bundle-fetch starting");

    let outcome = app::run(settings).await?;
    if !args.quiet {
        match outcome {
            RunOutcome::UpToDate => println!("Nothing to download; all bundles are up to date."),
            RunOutcome::Declined { total_bytes } => {
                println!("Download of {} declined.", format_size(total_bytes));
            }
            RunOutcome::Downloaded { bytes } => println!("Downloaded {}.", format_size(bytes)),
        }
    }
    Ok(())
}
