//! Asset-delivery backend the orchestrator drives.
//!
//! The orchestrator never talks to the network or the disk directly; it issues
//! requests through [`AssetBackend`] and tracks the returned
//! [`OperationHandle`]s. Requests must return immediately; the work happens on
//! tasks owned by the backend.
//!
//! - [`http::HttpAssetBackend`] - reference implementation over a static HTTP layout
//! - [`catalog`] - catalog manifest types shared by the HTTP backend

pub mod catalog;
pub mod http;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::labels::Label;
use crate::operation::{OperationHandle, OperationId};

pub use http::{HttpAssetBackend, HttpBackendOptions};

/// Identifier of a remote catalog with a pending update.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CatalogId(String);

impl CatalogId {
    /// Wraps a raw identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CatalogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of backend initialization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogInfo {
    /// Version of the locally available catalog, if any.
    pub version: Option<String>,
    /// Number of labels the local catalog describes.
    pub label_count: usize,
}

/// Narrow interface to the subsystem that owns catalogs and bundle storage.
///
/// Every request method returns without blocking. A request that cannot be
/// scheduled returns [`OperationHandle::invalid`].
pub trait AssetBackend: Send + Sync {
    /// Whether the network is currently reachable. Checked before each stage.
    fn is_reachable(&self) -> bool {
        true
    }

    /// Initializes the backend and loads the local catalog.
    fn initialize(&self) -> OperationHandle<CatalogInfo>;

    /// Lists remote catalogs that have pending updates.
    fn check_for_catalog_updates(&self) -> OperationHandle<Vec<CatalogId>>;

    /// Applies the given catalog updates.
    fn update_catalogs(&self, ids: Vec<CatalogId>) -> OperationHandle<()>;

    /// Bytes still to be downloaded for `label`.
    fn get_download_size(&self, label: &Label) -> OperationHandle<u64>;

    /// Downloads every bundle `label` depends on, reporting byte progress.
    fn download_dependencies(&self, label: &Label) -> OperationHandle<()>;

    /// Loads one cached asset by address.
    fn load_asset(&self, address: &str) -> OperationHandle<Arc<Vec<u8>>>;

    /// Frees backend resources held for an operation. Called exactly once per
    /// issued handle, after the handle itself was released.
    fn release(&self, id: OperationId);
}
