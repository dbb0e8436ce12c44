//! Fan-out / fan-in of one stage's operations.
//!
//! A [`StageBatch`] owns every handle a stage issued. Handles are checked for
//! validity as they are added, awaited together with a countdown over
//! [`FuturesUnordered`], and released back to the backend exactly once, either
//! explicitly or when the batch is dropped on an error path.

use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tracing::{debug, warn};

use super::OrchestratorError;
use crate::backend::AssetBackend;
use crate::operation::{
    OperationError, OperationHandle, OperationKind, OperationProgress, OperationStatus,
};

pub(crate) struct StageBatch<T> {
    kind: OperationKind,
    backend: Arc<dyn AssetBackend>,
    handles: Vec<OperationHandle<T>>,
}

impl<T> StageBatch<T> {
    pub(crate) fn new(kind: OperationKind, backend: Arc<dyn AssetBackend>) -> Self {
        Self {
            kind,
            backend,
            handles: Vec::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }

    /// Takes ownership of a freshly issued handle.
    ///
    /// An invalid handle is released immediately and turned into
    /// [`OrchestratorError::InvalidOperation`]; the caller propagates it and
    /// the batch releases whatever was issued before.
    pub(crate) fn issue(
        &mut self,
        handle: OperationHandle<T>,
    ) -> Result<&OperationHandle<T>, OrchestratorError> {
        if !handle.is_valid() {
            let error = OrchestratorError::InvalidOperation {
                kind: self.kind,
                label: handle.label().cloned(),
                source: handle.error().unwrap_or_else(|| {
                    OperationError::Unavailable("request was not scheduled".to_string())
                }),
            };
            warn!(kind = %self.kind, id = %handle.id(), error = %error, "invalid operation");
            self.backend.release(handle.release());
            return Err(error);
        }
        debug!(kind = %self.kind, id = %handle.id(), label = ?handle.label(), "operation issued");
        self.handles.push(handle);
        Ok(&self.handles[self.handles.len() - 1])
    }

    /// Suspends until every operation is terminal, or until the first one fails.
    pub(crate) async fn wait_all(&self) -> Result<(), OrchestratorError> {
        let mut remaining = self.handles.len();
        let mut pending: FuturesUnordered<_> = self
            .handles
            .iter()
            .enumerate()
            .map(|(index, handle)| async move { (index, handle.wait().await) })
            .collect();

        while let Some((index, status)) = pending.next().await {
            remaining -= 1;
            if status == OperationStatus::Failed {
                let handle = &self.handles[index];
                debug!(kind = %self.kind, id = %handle.id(), remaining, "stage aborted by failed operation");
                return Err(OrchestratorError::OperationFailed {
                    kind: self.kind,
                    label: handle.label().cloned(),
                    source: handle.error().unwrap_or(OperationError::Abandoned),
                });
            }
        }
        debug!(kind = %self.kind, count = self.handles.len(), "stage fan-in complete");
        Ok(())
    }

    /// Moves every result out, in issuance order.
    pub(crate) fn take_results(&mut self) -> Result<Vec<T>, OrchestratorError> {
        self.handles
            .iter_mut()
            .map(|handle| {
                handle.take_result().ok_or(OrchestratorError::MissingResult {
                    kind: handle.kind(),
                })
            })
            .collect()
    }

    /// Final progress of every operation, in issuance order.
    pub(crate) fn progress(&self) -> impl Iterator<Item = OperationProgress> + '_ {
        self.handles.iter().map(OperationHandle::progress)
    }

    /// Releases every handle back to the backend.
    pub(crate) fn release_all(mut self) {
        self.release_handles();
    }

    fn release_handles(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        let count = self.handles.len();
        for handle in self.handles.drain(..) {
            self.backend.release(handle.release());
        }
        debug!(kind = %self.kind, count, "released stage operations");
    }
}

impl<T> Drop for StageBatch<T> {
    fn drop(&mut self) {
        self.release_handles();
    }
}
