//! Staged download pipeline.
//!
//! [`DownloadOrchestrator`] drives the asset backend through a fixed sequence
//! of stages:
//!
//! ```text
//! WaitingForInitialize ─► Initializing ─► WaitingForCatalogCheck ─► CatalogChecking
//!        ┌──────────────────────────────────────────────────────────────┘
//!        ├─ no pending ids ───────────────────────────────┐
//!        └─ WaitingForCatalogUpdate ─► CatalogUpdating ───┤
//!                                                         ▼
//!   WaitingForSizeDownload ─► SizeDownloading ─► WaitingForDownload
//!                                                         │  start_download()
//!                                                         ▼
//!                                      Downloading ─► FinishDownload
//! ```
//!
//! `CatalogUpdated` fires before the move to `WaitingForSizeDownload`;
//! `SizeDownloaded` and `DownloadFinished` fire after their stage's
//! transition, so a consumer reacting to them already sees the state the
//! next `start_*` call requires.
//!
//! The size and download stages fan out one operation per label and fan back
//! in before advancing. Every handle of a stage is released before the next
//! stage is issued. The first failure aborts the stage, releases everything
//! it issued, emits one `Exception` notification and marks the run failed;
//! [`DownloadOrchestrator::reset`] is the only way back.
//!
//! All methods take `&self`; share the orchestrator through an `Arc` so a UI
//! task can poll [`DownloadOrchestrator::downloading_status`] while a stage is
//! suspended.

mod error;
mod fan;
mod state;

pub use error::OrchestratorError;
pub use state::OrchestratorState;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{AssetBackend, CatalogId};
use crate::events::{DownloadEvent, EventReceiver, ExceptionReport, NotificationSink, Notifier};
use crate::labels::{Label, LabelSet};
use crate::operation::{
    OperationHandle, OperationKind, OperationProgress, OperationStatus, ProgressProbe,
};
use crate::status::{DownloadStatus, ProgressAggregator};
use fan::StageBatch;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State machine sequencing catalog resolution, sizing and download.
pub struct DownloadOrchestrator {
    backend: Arc<dyn AssetBackend>,
    labels: LabelSet,
    state: watch::Sender<OrchestratorState>,
    tracked: RwLock<Vec<ProgressProbe>>,
    last_status: Mutex<DownloadStatus>,
    pending_catalogs: Mutex<Vec<CatalogId>>,
    total_size: Mutex<Option<u64>>,
    failed: AtomicBool,
    notifier: Notifier,
}

impl fmt::Debug for DownloadOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadOrchestrator")
            .field("state", &self.current_state())
            .field("labels", &self.labels)
            .field("failed", &self.has_failed())
            .finish_non_exhaustive()
    }
}

impl DownloadOrchestrator {
    /// Creates an orchestrator in [`OrchestratorState::WaitingForInitialize`].
    #[must_use]
    pub fn new(backend: Arc<dyn AssetBackend>, labels: LabelSet) -> Self {
        let (state, _) = watch::channel(OrchestratorState::WaitingForInitialize);
        Self {
            backend,
            labels,
            state,
            tracked: RwLock::new(Vec::new()),
            last_status: Mutex::new(DownloadStatus::idle()),
            pending_catalogs: Mutex::new(Vec::new()),
            total_size: Mutex::new(None),
            failed: AtomicBool::new(false),
            notifier: Notifier::new(),
        }
    }

    /// Current pipeline state.
    #[must_use]
    pub fn current_state(&self) -> OrchestratorState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<OrchestratorState> {
        self.state.subscribe()
    }

    /// Registers a notification sink. Register before starting a run; past
    /// notifications are not replayed.
    pub fn add_sink(&self, sink: Arc<dyn NotificationSink>) {
        self.notifier.add_sink(sink);
    }

    /// Registers a channel sink and returns its receiver.
    pub fn subscribe(&self) -> EventReceiver {
        self.notifier.subscribe()
    }

    /// Labels this orchestrator sizes and downloads.
    #[must_use]
    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    /// Total bytes reported by the last successful size stage.
    #[must_use]
    pub fn total_download_size(&self) -> Option<u64> {
        *lock(&self.total_size)
    }

    /// Catalog ids awaiting an update. Empty outside the catalog update stage.
    #[must_use]
    pub fn pending_catalogs(&self) -> Vec<CatalogId> {
        lock(&self.pending_catalogs).clone()
    }

    /// True once a stage failed; the run must be [`reset`](Self::reset).
    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Runs initialization, catalog resolution and the size stage.
    ///
    /// Returns the total number of bytes still to download across all labels
    /// and leaves the orchestrator in [`OrchestratorState::WaitingForDownload`].
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::ContractViolation`] if the orchestrator is not in
    /// [`OrchestratorState::WaitingForInitialize`] (nothing changes in that
    /// case). Any other error fails the run and is also delivered as an
    /// `Exception` notification.
    #[instrument(skip(self), fields(labels = self.labels.len()))]
    pub async fn start_initialize(&self) -> Result<u64, OrchestratorError> {
        self.enter(
            "start_initialize",
            OrchestratorState::WaitingForInitialize,
            OrchestratorState::Initializing,
        )?;
        let guard = StageGuard::arm(self, "start_initialize");
        info!("starting initialization");
        let result = self.run_initialize().await;
        guard.disarm();
        self.conclude(result)
    }

    /// Downloads every label's dependencies.
    ///
    /// Progress is observable through [`downloading_status`](Self::downloading_status)
    /// while this future is pending.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::ContractViolation`] if the orchestrator is not in
    /// [`OrchestratorState::WaitingForDownload`] (nothing changes in that
    /// case). Any other error fails the run and is also delivered as an
    /// `Exception` notification.
    #[instrument(skip(self), fields(labels = self.labels.len()))]
    pub async fn start_download(&self) -> Result<(), OrchestratorError> {
        self.enter(
            "start_download",
            OrchestratorState::WaitingForDownload,
            OrchestratorState::Downloading,
        )?;
        let guard = StageGuard::arm(self, "start_download");
        *lock(&self.last_status) = DownloadStatus::started();
        info!(
            total_bytes = self.total_download_size().unwrap_or(0),
            "starting download"
        );
        let result = self.run_download().await;
        guard.disarm();
        self.conclude(result)
    }

    /// Aggregate progress of the download stage.
    ///
    /// Sums the current progress of every tracked download that is still
    /// outstanding or has succeeded; released and failed operations do not
    /// contribute. With nothing contributing, returns the last committed
    /// status (`{0, 0, done}` before any download).
    #[must_use]
    pub fn downloading_status(&self) -> DownloadStatus {
        let contributions: Vec<OperationProgress> = {
            let tracked = self.tracked.read().unwrap_or_else(PoisonError::into_inner);
            tracked.iter().filter_map(contribution).collect()
        };
        if contributions.is_empty() {
            return *lock(&self.last_status);
        }
        ProgressAggregator::aggregate(contributions)
    }

    /// Returns to [`OrchestratorState::WaitingForInitialize`] for a new run.
    ///
    /// Allowed after a finished run, after a failed run, and before any run.
    /// A run whose `start_*` future was dropped mid-stage counts as failed.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::ResetWhileActive`] while a run is in progress.
    pub fn reset(&self) -> Result<(), OrchestratorError> {
        let failed = self.has_failed();
        let mut rejected = None;
        self.state.send_if_modified(|state| {
            let resettable = failed
                || matches!(
                    *state,
                    OrchestratorState::WaitingForInitialize | OrchestratorState::FinishDownload
                );
            if resettable {
                *state = OrchestratorState::WaitingForInitialize;
                true
            } else {
                rejected = Some(*state);
                false
            }
        });
        if let Some(state) = rejected {
            warn!(%state, "reset rejected");
            return Err(OrchestratorError::ResetWhileActive { state });
        }

        self.tracked
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        *lock(&self.last_status) = DownloadStatus::idle();
        lock(&self.pending_catalogs).clear();
        *lock(&self.total_size) = None;
        self.failed.store(false, Ordering::SeqCst);
        info!("orchestrator reset");
        Ok(())
    }

    /// Atomically moves from `expected` to `next`, or rejects the call.
    fn enter(
        &self,
        operation: &'static str,
        expected: OrchestratorState,
        next: OrchestratorState,
    ) -> Result<(), OrchestratorError> {
        let failed = self.has_failed();
        let mut actual = expected;
        let entered = self.state.send_if_modified(|state| {
            actual = *state;
            if *state == expected && !failed {
                *state = next;
                true
            } else {
                false
            }
        });
        if entered {
            debug!(from = %expected, to = %next, "state transition");
            return Ok(());
        }
        error!(operation, %expected, %actual, failed, "call rejected: orchestrator not in required state");
        Err(OrchestratorError::ContractViolation {
            operation,
            expected,
            actual,
        })
    }

    fn transition(&self, next: OrchestratorState) {
        let previous = self.state.send_replace(next);
        debug!(from = %previous, to = %next, "state transition");
    }

    fn ensure_reachable(&self) -> Result<(), OrchestratorError> {
        if self.backend.is_reachable() {
            Ok(())
        } else {
            Err(OrchestratorError::NetworkUnreachable)
        }
    }

    /// Marks the run failed and emits the `Exception` notification for errors.
    fn conclude<T>(&self, result: Result<T, OrchestratorError>) -> Result<T, OrchestratorError> {
        result.map_err(|err| {
            self.failed.store(true, Ordering::SeqCst);
            let stage = self.current_state();
            error!(%stage, error = %err, "run failed");
            let report = ExceptionReport::from_error(stage.as_str(), &err);
            self.notifier.emit(&DownloadEvent::Exception(report));
            err
        })
    }

    async fn run_initialize(&self) -> Result<u64, OrchestratorError> {
        self.ensure_reachable()?;
        let info = self
            .run_single(OperationKind::Initialize, self.backend.initialize())
            .await?;
        debug!(version = ?info.version, labels = info.label_count, "backend initialized");
        self.transition(OrchestratorState::WaitingForCatalogCheck);

        self.resolve_catalogs().await?;
        self.notifier.emit(&DownloadEvent::CatalogUpdated);
        self.transition(OrchestratorState::WaitingForSizeDownload);

        self.ensure_reachable()?;
        self.transition(OrchestratorState::SizeDownloading);
        let total = self.run_size_stage().await?;
        *lock(&self.total_size) = Some(total);
        self.transition(OrchestratorState::WaitingForDownload);
        info!(total_bytes = total, "size stage complete");
        self.notifier
            .emit(&DownloadEvent::SizeDownloaded { total_bytes: total });
        Ok(total)
    }

    async fn resolve_catalogs(&self) -> Result<(), OrchestratorError> {
        self.ensure_reachable()?;
        self.transition(OrchestratorState::CatalogChecking);
        let ids = self
            .run_single(
                OperationKind::CatalogCheck,
                self.backend.check_for_catalog_updates(),
            )
            .await?;
        if ids.is_empty() {
            info!("catalog is up to date");
            return Ok(());
        }

        info!(count = ids.len(), "catalog updates pending");
        lock(&self.pending_catalogs).clone_from(&ids);
        self.transition(OrchestratorState::WaitingForCatalogUpdate);
        self.ensure_reachable()?;
        self.transition(OrchestratorState::CatalogUpdating);
        self.run_single(OperationKind::CatalogUpdate, self.backend.update_catalogs(ids))
            .await?;
        lock(&self.pending_catalogs).clear();
        info!("catalog updated");
        Ok(())
    }

    /// Issues, awaits and releases one non-label operation.
    async fn run_single<T>(
        &self,
        kind: OperationKind,
        handle: OperationHandle<T>,
    ) -> Result<T, OrchestratorError> {
        let mut batch = StageBatch::new(kind, Arc::clone(&self.backend));
        batch.issue(handle)?;
        batch.wait_all().await?;
        let result = batch
            .take_results()?
            .pop()
            .ok_or(OrchestratorError::MissingResult { kind });
        batch.release_all();
        result
    }

    #[instrument(skip(self))]
    async fn run_size_stage(&self) -> Result<u64, OrchestratorError> {
        let mut batch = StageBatch::new(OperationKind::SizeQuery, Arc::clone(&self.backend));
        for label in &self.labels {
            batch.issue(self.backend.get_download_size(label))?;
        }
        debug!(count = batch.len(), "size queries issued");
        batch.wait_all().await?;
        let total = sum_sizes(&self.labels, batch.take_results()?);
        batch.release_all();
        Ok(total)
    }

    #[instrument(skip(self))]
    async fn run_download(&self) -> Result<(), OrchestratorError> {
        let mut batch = StageBatch::new(OperationKind::Download, Arc::clone(&self.backend));
        let outcome = self.issue_and_await_downloads(&mut batch).await;

        let committed = match &outcome {
            Ok(()) => DownloadStatus {
                is_done: true,
                ..ProgressAggregator::aggregate(batch.progress())
            },
            Err(_) => DownloadStatus::idle(),
        };
        *lock(&self.last_status) = committed;
        self.tracked
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        batch.release_all();
        outcome?;

        self.transition(OrchestratorState::FinishDownload);
        info!(
            downloaded_bytes = committed.downloaded_bytes,
            "download stage complete"
        );
        self.notifier.emit(&DownloadEvent::DownloadFinished);
        Ok(())
    }

    async fn issue_and_await_downloads(
        &self,
        batch: &mut StageBatch<()>,
    ) -> Result<(), OrchestratorError> {
        self.ensure_reachable()?;
        for label in &self.labels {
            let handle = batch.issue(self.backend.download_dependencies(label))?;
            self.tracked
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .push(handle.probe());
        }
        debug!(count = batch.len(), "downloads issued");
        batch.wait_all().await
    }
}

/// Fails the run if a stage future is dropped before it concludes.
///
/// Armed right after `enter`, disarmed once the stage's result is in hand.
struct StageGuard<'a> {
    orchestrator: &'a DownloadOrchestrator,
    operation: &'static str,
    armed: bool,
}

impl<'a> StageGuard<'a> {
    fn arm(orchestrator: &'a DownloadOrchestrator, operation: &'static str) -> Self {
        Self {
            orchestrator,
            operation,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StageGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let orchestrator = self.orchestrator;
        orchestrator.failed.store(true, Ordering::SeqCst);
        orchestrator
            .tracked
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        *lock(&orchestrator.last_status) = DownloadStatus::idle();
        warn!(
            operation = self.operation,
            stage = %orchestrator.current_state(),
            "stage dropped before completion; run marked failed"
        );
    }
}

/// What one tracked download adds to the status query: outstanding
/// operations and successful ones.
fn contribution(probe: &ProgressProbe) -> Option<OperationProgress> {
    probe.outstanding_progress().or_else(|| {
        (probe.is_valid() && probe.status() == OperationStatus::Succeeded)
            .then(|| probe.progress())
    })
}

fn sum_sizes(labels: &LabelSet, sizes: Vec<u64>) -> u64 {
    labels
        .iter()
        .zip(sizes)
        .fold(0_u64, |total, (label, size): (&Label, u64)| {
            debug!(label = %label, bytes = size, "label size");
            total.saturating_add(size)
        })
}
