//! Aggregate download status and the progress aggregator.
//!
//! A [`DownloadStatus`] is never mutated incrementally: every status query
//! builds a fresh one from the per-operation snapshots via
//! [`ProgressAggregator::aggregate`].

use crate::operation::OperationProgress;

/// Aggregate byte counters across every tracked download operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadStatus {
    /// Sum of the expected sizes of the contributing operations.
    pub total_bytes: u64,
    /// Sum of the bytes already transferred by the contributing operations.
    pub downloaded_bytes: u64,
    /// True when every contributing operation reports done.
    pub is_done: bool,
}

impl DownloadStatus {
    /// Status used when nothing is tracked: zero bytes, done.
    #[must_use]
    pub const fn idle() -> Self {
        Self {
            total_bytes: 0,
            downloaded_bytes: 0,
            is_done: true,
        }
    }

    /// Status used at the start of a download stage: zero bytes, not done.
    #[must_use]
    pub const fn started() -> Self {
        Self {
            total_bytes: 0,
            downloaded_bytes: 0,
            is_done: false,
        }
    }

    /// Completion ratio in `0.0..=1.0`; zero when the total is unknown.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.downloaded_bytes as f64 / self.total_bytes as f64
        }
    }

    /// Completion percentage in `0.0..=100.0`.
    #[must_use]
    pub fn percent(&self) -> f64 {
        self.ratio() * 100.0
    }
}

impl Default for DownloadStatus {
    fn default() -> Self {
        Self::idle()
    }
}

/// Combines per-operation progress snapshots into one [`DownloadStatus`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressAggregator;

impl ProgressAggregator {
    /// Sums the snapshots and ANDs their done flags.
    ///
    /// An empty input yields [`DownloadStatus::idle`]. A snapshot whose total
    /// is still unknown counts its downloaded bytes as its total, so the
    /// result never reports more downloaded than total bytes. Sums saturate
    /// rather than wrap.
    #[must_use]
    pub fn aggregate<I>(snapshots: I) -> DownloadStatus
    where
        I: IntoIterator<Item = OperationProgress>,
    {
        snapshots
            .into_iter()
            .fold(DownloadStatus::idle(), |acc, snapshot| DownloadStatus {
                total_bytes: acc
                    .total_bytes
                    .saturating_add(snapshot.total_bytes.max(snapshot.downloaded_bytes)),
                downloaded_bytes: acc
                    .downloaded_bytes
                    .saturating_add(snapshot.downloaded_bytes),
                is_done: acc.is_done && snapshot.is_done,
            })
    }
}
