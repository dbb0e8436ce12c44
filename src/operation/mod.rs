//! Handles to asynchronous remote operations.
//!
//! Every backend request returns an [`OperationHandle`] immediately; the
//! backend keeps the paired [`OperationReporter`] and drives it from its own
//! task. The handle side can query validity, status, progress and the result,
//! and can suspend until the operation reaches a terminal state.
//!
//! # Lifecycle
//!
//! ```text
//! backend request ──► (OperationHandle, OperationReporter)
//!                          │                 │
//!                          │                 ├── report_progress(..)
//!                          │                 └── succeed(value) / fail(err) / drop
//!                          ├── wait().await
//!                          ├── take_result()
//!                          └── release()  ──► backend.release(id)
//! ```
//!
//! A released handle reports `is_valid() == false` and must not be queried
//! for progress again.

mod error;

pub use error::OperationError;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::labels::Label;

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(u64);

impl OperationId {
    fn next() -> Self {
        Self(NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// What a remote operation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Backend initialization.
    Initialize,
    /// Check whether remote catalogs have pending updates.
    CatalogCheck,
    /// Apply pending catalog updates.
    CatalogUpdate,
    /// Query the remaining download size of one label.
    SizeQuery,
    /// Download the bundles one label depends on.
    Download,
    /// Load one cached asset.
    AssetLoad,
}

impl OperationKind {
    /// Stable lowercase name for logs and messages.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::CatalogCheck => "catalog check",
            Self::CatalogUpdate => "catalog update",
            Self::SizeQuery => "size query",
            Self::Download => "download",
            Self::AssetLoad => "asset load",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Completion state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    /// Still running.
    Pending,
    /// Finished and produced a result.
    Succeeded,
    /// Finished with an error, or was invalid from the start.
    Failed,
}

impl OperationStatus {
    /// True for `Succeeded` and `Failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Byte-level progress snapshot of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OperationProgress {
    /// Bytes transferred so far.
    pub downloaded_bytes: u64,
    /// Bytes expected in total; zero while unknown.
    pub total_bytes: u64,
    /// True once the transfer has completed.
    pub is_done: bool,
}

struct Shared<T> {
    id: OperationId,
    kind: OperationKind,
    label: Option<Label>,
    valid: bool,
    released: AtomicBool,
    status: watch::Sender<OperationStatus>,
    progress: Mutex<OperationProgress>,
    result: Mutex<Option<T>>,
    error: Mutex<Option<OperationError>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T> Shared<T> {
    fn new(kind: OperationKind, label: Option<Label>, valid: bool, status: OperationStatus) -> Self {
        let (status, _) = watch::channel(status);
        Self {
            id: OperationId::next(),
            kind,
            label,
            valid,
            released: AtomicBool::new(false),
            status,
            progress: Mutex::new(OperationProgress::default()),
            result: Mutex::new(None),
            error: Mutex::new(None),
        }
    }

    fn is_valid(&self) -> bool {
        self.valid && !self.released.load(Ordering::SeqCst)
    }

    fn status(&self) -> OperationStatus {
        *self.status.borrow()
    }

    fn progress(&self) -> OperationProgress {
        *lock(&self.progress)
    }
}

/// Handle to one outstanding remote operation.
///
/// Owned exclusively by whoever issued the request until [`release`](Self::release)
/// is called.
pub struct OperationHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> fmt::Debug for OperationHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationHandle")
            .field("id", &self.shared.id)
            .field("kind", &self.shared.kind)
            .field("label", &self.shared.label)
            .field("valid", &self.is_valid())
            .field("status", &self.status())
            .finish()
    }
}

impl<T> OperationHandle<T> {
    /// Creates a pending operation and the reporter that will complete it.
    #[must_use]
    pub fn pending(kind: OperationKind, label: Option<Label>) -> (Self, OperationReporter<T>) {
        let shared = Arc::new(Shared::new(kind, label, true, OperationStatus::Pending));
        (
            Self {
                shared: Arc::clone(&shared),
            },
            OperationReporter {
                shared,
                finished: false,
            },
        )
    }

    /// Creates a handle for a request that could not be scheduled.
    #[must_use]
    pub fn invalid(kind: OperationKind, label: Option<Label>, error: OperationError) -> Self {
        let shared = Shared::new(kind, label, false, OperationStatus::Failed);
        *lock(&shared.error) = Some(error);
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Creates a handle that has already succeeded with `value`.
    #[must_use]
    pub fn completed(kind: OperationKind, label: Option<Label>, value: T) -> Self {
        let (handle, reporter) = Self::pending(kind, label);
        reporter.succeed(value);
        handle
    }

    /// Identifier shared with the backend.
    #[must_use]
    pub fn id(&self) -> OperationId {
        self.shared.id
    }

    /// Operation kind.
    #[must_use]
    pub fn kind(&self) -> OperationKind {
        self.shared.kind
    }

    /// Label this operation was issued for, if any.
    #[must_use]
    pub fn label(&self) -> Option<&Label> {
        self.shared.label.as_ref()
    }

    /// False if the request could not be scheduled or the handle was released.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.shared.is_valid()
    }

    /// True once the operation reached a terminal state.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.status().is_terminal()
    }

    /// Current completion state.
    #[must_use]
    pub fn status(&self) -> OperationStatus {
        self.shared.status()
    }

    /// Current byte progress.
    #[must_use]
    pub fn progress(&self) -> OperationProgress {
        self.shared.progress()
    }

    /// Error reported by the backend, if the operation failed or was invalid.
    #[must_use]
    pub fn error(&self) -> Option<OperationError> {
        lock(&self.shared.error).clone()
    }

    /// Moves the result out of a succeeded operation.
    ///
    /// Returns `None` before success or when the result was already taken.
    pub fn take_result(&mut self) -> Option<T> {
        lock(&self.shared.result).take()
    }

    /// Suspends until the operation is terminal and returns the final status.
    pub async fn wait(&self) -> OperationStatus {
        let mut rx = self.shared.status.subscribe();
        // The sender lives in `shared`, which this handle keeps alive.
        match rx.wait_for(|status| status.is_terminal()).await {
            Ok(status) => *status,
            Err(_) => OperationStatus::Failed,
        }
    }

    /// Marks the handle released and returns its id for the backend.
    ///
    /// Any probe created from this handle stops reporting it as outstanding.
    pub fn release(self) -> OperationId {
        self.shared.released.store(true, Ordering::SeqCst);
        self.shared.id
    }
}

impl<T: Send + 'static> OperationHandle<T> {
    /// Read-only progress view that can be shared with status readers.
    #[must_use]
    pub fn probe(&self) -> ProgressProbe {
        ProgressProbe {
            view: Arc::clone(&self.shared) as Arc<dyn ProgressView>,
        }
    }
}

trait ProgressView: Send + Sync {
    fn id(&self) -> OperationId;
    fn is_valid(&self) -> bool;
    fn status(&self) -> OperationStatus;
    fn progress(&self) -> OperationProgress;
}

impl<T: Send> ProgressView for Shared<T> {
    fn id(&self) -> OperationId {
        self.id
    }

    fn is_valid(&self) -> bool {
        Shared::is_valid(self)
    }

    fn status(&self) -> OperationStatus {
        Shared::status(self)
    }

    fn progress(&self) -> OperationProgress {
        Shared::progress(self)
    }
}

/// Cloneable, type-erased, read-only view of an operation's progress.
#[derive(Clone)]
pub struct ProgressProbe {
    view: Arc<dyn ProgressView>,
}

impl fmt::Debug for ProgressProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressProbe")
            .field("id", &self.view.id())
            .field("status", &self.view.status())
            .finish()
    }
}

impl ProgressProbe {
    /// Id of the observed operation.
    #[must_use]
    pub fn id(&self) -> OperationId {
        self.view.id()
    }

    /// Progress snapshot if the operation is still outstanding
    /// (valid, not done, not failed); `None` otherwise.
    #[must_use]
    pub fn outstanding_progress(&self) -> Option<OperationProgress> {
        if !self.view.is_valid() || self.view.status().is_terminal() {
            return None;
        }
        Some(self.view.progress())
    }

    /// False once the operation was released or if it was never scheduled.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.view.is_valid()
    }

    /// Current completion state of the observed operation.
    #[must_use]
    pub fn status(&self) -> OperationStatus {
        self.view.status()
    }

    /// Progress snapshot regardless of state.
    #[must_use]
    pub fn progress(&self) -> OperationProgress {
        self.view.progress()
    }
}

/// Backend-side half of an operation.
///
/// Dropping a reporter before calling [`succeed`](Self::succeed) or
/// [`fail`](Self::fail) fails the operation with [`OperationError::Abandoned`].
pub struct OperationReporter<T> {
    shared: Arc<Shared<T>>,
    finished: bool,
}

impl<T> fmt::Debug for OperationReporter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationReporter")
            .field("id", &self.shared.id)
            .field("kind", &self.shared.kind)
            .finish_non_exhaustive()
    }
}

impl<T> OperationReporter<T> {
    /// Id of the operation being driven.
    #[must_use]
    pub fn id(&self) -> OperationId {
        self.shared.id
    }

    /// True once the issuer released the handle; the backend may stop work.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.shared.released.load(Ordering::SeqCst)
    }

    /// Publishes byte progress. `downloaded` is clamped to `total` when the
    /// total is known.
    pub fn report_progress(&self, downloaded_bytes: u64, total_bytes: u64) {
        let downloaded_bytes = if total_bytes > 0 {
            downloaded_bytes.min(total_bytes)
        } else {
            downloaded_bytes
        };
        let mut progress = lock(&self.shared.progress);
        progress.downloaded_bytes = downloaded_bytes;
        progress.total_bytes = total_bytes;
    }

    /// Completes the operation successfully.
    pub fn succeed(mut self, value: T) {
        *lock(&self.shared.result) = Some(value);
        {
            let mut progress = lock(&self.shared.progress);
            progress.downloaded_bytes = progress.total_bytes.max(progress.downloaded_bytes);
            progress.total_bytes = progress.downloaded_bytes;
            progress.is_done = true;
        }
        self.finish(OperationStatus::Succeeded);
    }

    /// Completes the operation with an error.
    pub fn fail(mut self, error: OperationError) {
        *lock(&self.shared.error) = Some(error);
        self.finish(OperationStatus::Failed);
    }

    fn finish(&mut self, status: OperationStatus) {
        self.finished = true;
        self.shared.status.send_replace(status);
    }
}

impl<T> Drop for OperationReporter<T> {
    fn drop(&mut self) {
        if !self.finished {
            *lock(&self.shared.error) = Some(OperationError::Abandoned);
            self.finish(OperationStatus::Failed);
        }
    }
}
