//! Lifecycle notifications emitted by the orchestrator.
//!
//! Consumers either implement [`NotificationSink`] and register it with
//! [`Notifier::add_sink`], or take an [`EventReceiver`] from
//! [`Notifier::subscribe`] and drain [`DownloadEvent`]s on their own task.
//! Notifications are delivered in emission order. Nothing is buffered for
//! consumers that register after an event fired.

use std::error::Error as StdError;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::trace;

/// Fatal error payload: human-readable message plus diagnostic trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionReport {
    /// Short description of what failed.
    pub message: String,
    /// Stage, error source chain and backtrace (when captured).
    pub trace: String,
}

impl ExceptionReport {
    /// Builds a report from an error, walking its `source()` chain.
    ///
    /// A backtrace is appended when `RUST_BACKTRACE` enables capture.
    #[must_use]
    pub fn from_error(stage: &str, error: &(dyn StdError + 'static)) -> Self {
        let mut trace = format!("stage: {stage}");
        let mut source = error.source();
        while let Some(cause) = source {
            trace.push_str("\ncaused by: ");
            trace.push_str(&cause.to_string());
            source = cause.source();
        }
        let backtrace = std::backtrace::Backtrace::capture();
        if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
            trace.push('\n');
            trace.push_str(&backtrace.to_string());
        }
        Self {
            message: error.to_string(),
            trace,
        }
    }
}

impl fmt::Display for ExceptionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n[Call Stack]\n{}", self.message, self.trace)
    }
}

/// One lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    /// Catalog check (and update, if one was pending) completed.
    CatalogUpdated,
    /// Size query stage completed with the total bytes still to download.
    SizeDownloaded {
        /// Sum over all labels.
        total_bytes: u64,
    },
    /// Every download operation completed.
    DownloadFinished,
    /// The run failed.
    Exception(ExceptionReport),
}

/// Sender half of an event channel.
pub type EventSender = UnboundedSender<DownloadEvent>;

/// Receiver half of an event channel.
pub type EventReceiver = UnboundedReceiver<DownloadEvent>;

/// Creates a new event channel.
#[must_use]
pub fn channel() -> (EventSender, EventReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}

/// Callback interface for lifecycle notifications.
///
/// Every method defaults to a no-op so consumers implement only what they
/// care about. Callbacks run inline on the orchestration task and should
/// return quickly.
pub trait NotificationSink: Send + Sync {
    /// Catalog resolution finished, whether or not an update was applied.
    fn on_catalog_updated(&self) {}

    /// Size query finished.
    fn on_size_downloaded(&self, _total_bytes: u64) {}

    /// Download stage finished.
    fn on_download_finished(&self) {}

    /// Fatal error; the run must be restarted.
    fn on_exception(&self, _report: &ExceptionReport) {}
}

impl NotificationSink for EventSender {
    fn on_catalog_updated(&self) {
        let _ = self.send(DownloadEvent::CatalogUpdated);
    }

    fn on_size_downloaded(&self, total_bytes: u64) {
        let _ = self.send(DownloadEvent::SizeDownloaded { total_bytes });
    }

    fn on_download_finished(&self) {
        let _ = self.send(DownloadEvent::DownloadFinished);
    }

    fn on_exception(&self, report: &ExceptionReport) {
        let _ = self.send(DownloadEvent::Exception(report.clone()));
    }
}

/// Fan-out of notifications to every registered sink.
#[derive(Default)]
pub struct Notifier {
    sinks: RwLock<Vec<Arc<dyn NotificationSink>>>,
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("sinks", &self.sink_count())
            .finish()
    }
}

impl Notifier {
    /// Creates a notifier with no sinks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a sink.
    pub fn add_sink(&self, sink: Arc<dyn NotificationSink>) {
        self.sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sink);
    }

    /// Registers a channel sink and returns its receiver.
    pub fn subscribe(&self) -> EventReceiver {
        let (tx, rx) = channel();
        self.add_sink(Arc::new(tx));
        rx
    }

    /// Number of registered sinks.
    #[must_use]
    pub fn sink_count(&self) -> usize {
        self.sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Delivers one event to every sink, in registration order.
    pub fn emit(&self, event: &DownloadEvent) {
        trace!(?event, "emitting notification");
        // Snapshot so a sink may register further sinks without deadlocking.
        let sinks = self
            .sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for sink in &sinks {
            match event {
                DownloadEvent::CatalogUpdated => sink.on_catalog_updated(),
                DownloadEvent::SizeDownloaded { total_bytes } => {
                    sink.on_size_downloaded(*total_bytes);
                }
                DownloadEvent::DownloadFinished => sink.on_download_finished(),
                DownloadEvent::Exception(report) => sink.on_exception(report),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl NotificationSink for Recorder {
        fn on_size_downloaded(&self, total_bytes: u64) {
            self.seen.lock().unwrap().push(format!("size:{total_bytes}"));
        }

        fn on_download_finished(&self) {
            self.seen.lock().unwrap().push("finished".to_string());
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("outer failure")]
    struct Outer(#[source] std::io::Error);

    #[test]
    fn test_report_walks_source_chain() {
        let err = Outer(std::io::Error::other("disk gone"));
        let report = ExceptionReport::from_error("download", &err);
        assert_eq!(report.message, "outer failure");
        assert!(report.trace.starts_with("stage: download"));
        assert!(report.trace.contains("caused by: disk gone"));
    }

    #[test]
    fn test_report_display_layout() {
        let report = ExceptionReport {
            message: "boom".to_string(),
            trace: "stage: size query".to_string(),
        };
        assert_eq!(report.to_string(), "boom\n[Call Stack]\nstage: size query");
    }

    #[test]
    fn test_default_methods_are_noops() {
        let notifier = Notifier::new();
        let recorder = Arc::new(Recorder::default());
        notifier.add_sink(recorder.clone());

        notifier.emit(&DownloadEvent::CatalogUpdated);
        notifier.emit(&DownloadEvent::SizeDownloaded { total_bytes: 7 });
        notifier.emit(&DownloadEvent::DownloadFinished);

        assert_eq!(*recorder.seen.lock().unwrap(), vec!["size:7", "finished"]);
    }

    #[tokio::test]
    async fn test_subscribe_receives_in_order() {
        let notifier = Notifier::new();
        let mut rx = notifier.subscribe();
        notifier.emit(&DownloadEvent::CatalogUpdated);
        notifier.emit(&DownloadEvent::SizeDownloaded { total_bytes: 3 });

        assert_eq!(rx.recv().await, Some(DownloadEvent::CatalogUpdated));
        assert_eq!(
            rx.recv().await,
            Some(DownloadEvent::SizeDownloaded { total_bytes: 3 })
        );
    }

    #[test]
    fn test_late_subscriber_gets_nothing_buffered() {
        let notifier = Notifier::new();
        notifier.emit(&DownloadEvent::DownloadFinished);
        let mut rx = notifier.subscribe();
        assert!(rx.try_recv().is_err());
        assert_eq!(notifier.sink_count(), 1);
    }
}
