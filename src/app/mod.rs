//! Run flow for the CLI: settings resolution, the download run, and its outcome.

pub(crate) mod config;
pub(crate) mod progress;
pub(crate) mod terminal;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result, bail};
use bundle_fetch_core::backend::http::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
use bundle_fetch_core::{
    DownloadOrchestrator, FileLabelSource, HttpAssetBackend, HttpBackendOptions, LabelSource,
    StaticLabelSource,
};
use tracing::{debug, info};
use url::Url;

use crate::cli::Args;
use config::{FileConfig, LoadedConfig};

/// Cache directory used when neither the CLI nor the config names one.
pub(crate) const DEFAULT_CACHE_DIR: &str = "bundle-cache";

/// Everything a run needs, after merging CLI flags over the config file.
pub(crate) struct RunSettings {
    pub(crate) base_url: Url,
    pub(crate) cache_dir: PathBuf,
    pub(crate) label_source: Box<dyn LabelSource>,
    pub(crate) assume_yes: bool,
    pub(crate) connect_timeout_secs: u64,
    pub(crate) read_timeout_secs: u64,
    pub(crate) use_progress_bar: bool,
}

/// How a run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunOutcome {
    /// Every bundle was already cached.
    UpToDate,
    /// The user answered no to the confirmation prompt.
    Declined { total_bytes: u64 },
    /// Every label was downloaded.
    Downloaded { bytes: u64 },
}

/// Tracing level from flags, falling back to the config file.
///
/// Priority: quiet flag > verbose flag > config verbosity > default (info).
/// `RUST_LOG` still overrides the result at subscriber level.
pub(crate) fn log_level(args: &Args, file: &FileConfig) -> &'static str {
    if args.quiet {
        return "error";
    }
    match args.verbose {
        0 => file.verbosity.map_or("info", config::VerbositySetting::level),
        1 => "debug",
        _ => "trace",
    }
}

pub(crate) fn resolve_settings(
    args: &Args,
    loaded: &LoadedConfig,
    stderr_is_terminal: bool,
) -> Result<RunSettings> {
    let file = loaded.config_or_default();
    let config_hint = loaded.path.as_ref().map_or_else(
        || "the config file".to_string(),
        |path| format!("'{}'", path.display()),
    );

    let Some(base_url) = args.base_url.clone().or_else(|| file.base_url.clone()) else {
        bail!("No base URL configured; pass --base-url or set `base_url` in {config_hint}");
    };

    let label_source: Box<dyn LabelSource> = if !args.labels.is_empty() {
        Box::new(StaticLabelSource::new(args.labels.clone()))
    } else if let Some(path) = &args.labels_file {
        Box::new(FileLabelSource::new(path))
    } else if let Some(labels) = &file.labels {
        Box::new(StaticLabelSource::new(labels.clone()))
    } else if let Some(path) = &file.labels_file {
        Box::new(FileLabelSource::new(path))
    } else {
        bail!(
            "No labels configured; pass --label or --labels-file, or set `labels` in {config_hint}"
        );
    };

    Ok(RunSettings {
        base_url,
        cache_dir: args
            .cache_dir
            .clone()
            .or(file.cache_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR)),
        label_source,
        assume_yes: args.yes || file.assume_yes.unwrap_or(false),
        connect_timeout_secs: args
            .connect_timeout
            .or(file.connect_timeout_secs)
            .unwrap_or(CONNECT_TIMEOUT_SECS),
        read_timeout_secs: args
            .read_timeout
            .or(file.read_timeout_secs)
            .unwrap_or(READ_TIMEOUT_SECS),
        use_progress_bar: terminal::should_use_progress_bar(
            stderr_is_terminal,
            args.quiet,
            terminal::is_dumb_terminal(),
            args.no_progress,
        ),
    })
}

/// Loads labels, runs initialization and (after confirmation) the download.
pub(crate) async fn run(settings: RunSettings) -> Result<RunOutcome> {
    let labels = settings
        .label_source
        .load()
        .await
        .with_context(|| format!("Failed to load labels from {}", settings.label_source.describe()))?;
    if labels.is_empty() {
        bail!("Label list is empty; nothing to download");
    }
    debug!(labels = labels.len(), source = %settings.label_source.describe(), "labels loaded");

    let backend = HttpAssetBackend::new(HttpBackendOptions {
        base_url: settings.base_url.clone(),
        cache_dir: settings.cache_dir.clone(),
        connect_timeout_secs: settings.connect_timeout_secs,
        read_timeout_secs: settings.read_timeout_secs,
    })
    .context("Failed to create HTTP backend")?;

    let orchestrator = Arc::new(DownloadOrchestrator::new(Arc::new(backend), labels));
    let reporter = progress::spawn_event_reporter(orchestrator.subscribe());

    let outcome = drive(&orchestrator, &settings).await;

    // Dropping the orchestrator closes the event channel so the reporter drains and exits.
    drop(orchestrator);
    let _ = reporter.await;
    outcome
}

async fn drive(
    orchestrator: &Arc<DownloadOrchestrator>,
    settings: &RunSettings,
) -> Result<RunOutcome> {
    info!(base_url = %settings.base_url, cache_dir = %settings.cache_dir.display(), "Resolving catalog");
    let total_bytes = orchestrator
        .start_initialize()
        .await
        .context("Initialization failed")?;
    if total_bytes == 0 {
        return Ok(RunOutcome::UpToDate);
    }

    if !settings.assume_yes {
        let prompt = format!(
            "Download {}? This may use a lot of data.",
            progress::format_size(total_bytes)
        );
        let accepted = tokio::task::spawn_blocking(move || terminal::confirm(&prompt))
            .await
            .context("Confirmation prompt task failed")??;
        if !accepted {
            return Ok(RunOutcome::Declined { total_bytes });
        }
    }

    let (bar, stop) =
        progress::spawn_progress_ui(settings.use_progress_bar, Arc::clone(orchestrator));
    let result = orchestrator.start_download().await;
    stop.store(true, Ordering::SeqCst);
    if let Some(bar) = bar {
        let _ = bar.await;
    }
    result.context("Download failed")?;

    Ok(RunOutcome::Downloaded {
        bytes: orchestrator.downloading_status().downloaded_bytes,
    })
}
