//! Bundle Fetch Core Library
//!
//! Staged, resumable download of remote asset bundles: catalog version
//! check, catalog update, aggregate size estimation across labeled asset
//! groups, and parallel download with live progress aggregation.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`orchestrator`] - The staged download state machine
//! - [`operation`] - Handles to asynchronous backend operations
//! - [`backend`] - The asset-delivery backend interface and its HTTP implementation
//! - [`status`] - Aggregate download status and progress aggregation
//! - [`events`] - Lifecycle notifications for UI consumers
//! - [`labels`] - Label identifiers and label configuration sources
//! - [`cache`] - Reference-counted loaded-asset cache
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use bundle_fetch_core::{DownloadOrchestrator, HttpAssetBackend, HttpBackendOptions, LabelSet};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let options = HttpBackendOptions::new("https://cdn.example/game/".parse()?, "./cache");
//! let backend = Arc::new(HttpAssetBackend::new(options)?);
//! let orchestrator = DownloadOrchestrator::new(backend, LabelSet::new(["env", "chars"])?);
//!
//! let total = orchestrator.start_initialize().await?;
//! if total > 0 {
//!     orchestrator.start_download().await?;
//! }
//! # Ok(())
//! # }
//! ```

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod cache;
pub mod events;
pub mod labels;
pub mod operation;
pub mod orchestrator;
pub mod status;

// Re-export commonly used types
pub use backend::{AssetBackend, CatalogId, CatalogInfo, HttpAssetBackend, HttpBackendOptions};
pub use cache::{AssetCache, CacheError};
pub use events::{
    DownloadEvent, EventReceiver, EventSender, ExceptionReport, NotificationSink, Notifier,
};
pub use labels::{FileLabelSource, Label, LabelError, LabelSet, LabelSource, StaticLabelSource};
pub use operation::{
    OperationError, OperationHandle, OperationId, OperationKind, OperationProgress,
    OperationReporter, OperationStatus, ProgressProbe,
};
pub use orchestrator::{DownloadOrchestrator, OrchestratorError, OrchestratorState};
pub use status::{DownloadStatus, ProgressAggregator};
