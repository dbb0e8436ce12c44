//! Progress UI and notification reporting for download runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bundle_fetch_core::{DownloadEvent, DownloadOrchestrator, EventReceiver};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, error, info};

const POLL_INTERVAL: Duration = Duration::from_millis(120);

const ONE_KB: u64 = 1_000;
const ONE_MB: u64 = 1_000_000;
const ONE_GB: u64 = 1_000_000_000;

/// Display unit for byte counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SizeUnit {
    Byte,
    Kb,
    Mb,
    Gb,
}

impl SizeUnit {
    /// Unit chosen by decimal thresholds.
    pub(crate) fn for_bytes(bytes: u64) -> Self {
        if bytes >= ONE_GB {
            Self::Gb
        } else if bytes >= ONE_MB {
            Self::Mb
        } else if bytes >= ONE_KB {
            Self::Kb
        } else {
            Self::Byte
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Self::Byte => "B",
            Self::Kb => "KB",
            Self::Mb => "MB",
            Self::Gb => "GB",
        }
    }

    fn divisor(self) -> f64 {
        match self {
            Self::Byte => 1.0,
            Self::Kb => 1024.0,
            Self::Mb => 1024.0 * 1024.0,
            Self::Gb => 1024.0 * 1024.0 * 1024.0,
        }
    }

    /// `bytes` expressed in this unit, two decimals.
    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn render(self, bytes: u64) -> String {
        match self {
            Self::Byte => format!("{bytes} B"),
            _ => format!("{:.2} {}", bytes as f64 / self.divisor(), self.suffix()),
        }
    }
}

/// Formats a byte count in its own unit.
pub(crate) fn format_size(bytes: u64) -> String {
    SizeUnit::for_bytes(bytes).render(bytes)
}

/// `downloaded / total` with both values in the unit of `total`.
pub(crate) fn format_progress(downloaded: u64, total: u64) -> String {
    let unit = SizeUnit::for_bytes(total);
    format!("{} / {}", unit.render(downloaded), unit.render(total))
}

/// Spawns the progress bar when requested.
/// Returns (handle, stop) so the caller can signal stop and await the handle.
/// When `use_bar` is false, returns (None, stop) with stop already true.
pub(crate) fn spawn_progress_ui(
    use_bar: bool,
    orchestrator: Arc<DownloadOrchestrator>,
) -> (Option<tokio::task::JoinHandle<()>>, Arc<AtomicBool>) {
    if !use_bar {
        return (None, Arc::new(AtomicBool::new(true)));
    }
    let stop = Arc::new(AtomicBool::new(false));
    let handle = spawn_bar_inner(orchestrator, Arc::clone(&stop));
    (Some(handle), stop)
}

fn spawn_bar_inner(
    orchestrator: Arc<DownloadOrchestrator>,
    stop: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner} [{bar:40}] {percent:>3}% {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.enable_steady_tick(Duration::from_millis(100));

        while !stop.load(Ordering::SeqCst) {
            let status = orchestrator.downloading_status();
            bar.set_length(status.total_bytes);
            bar.set_position(status.downloaded_bytes);
            bar.set_message(format_progress(status.downloaded_bytes, status.total_bytes));
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        bar.finish_and_clear();
    })
}

/// Drains orchestrator notifications into the log until the channel closes.
pub(crate) fn spawn_event_reporter(mut events: EventReceiver) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                DownloadEvent::CatalogUpdated => info!("Catalog is up to date"),
                DownloadEvent::SizeDownloaded { total_bytes } => {
                    info!(
                        total_bytes,
                        size = %format_size(total_bytes),
                        "Download size calculated"
                    );
                }
                DownloadEvent::DownloadFinished => info!("Download finished"),
                DownloadEvent::Exception(report) => {
                    error!(message = %report.message, "Download run failed");
                    debug!(trace = %report.trace, "Failure details");
                }
            }
        }
    })
}
