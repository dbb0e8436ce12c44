//! Catalog manifest and local cache layout used by the HTTP backend.
//!
//! Remote and local layouts mirror each other:
//!
//! ```text
//! catalog.hash          version token of the catalog
//! catalog.json          { "version": "...", "labels": { "env": [ { "name": "...", "size": 123 } ] } }
//! bundles/<name>        bundle payloads
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::CatalogInfo;
use crate::labels::Label;
use crate::operation::OperationError;

/// File name of the catalog manifest.
pub const CATALOG_FILE: &str = "catalog.json";

/// File name of the catalog version token.
pub const CATALOG_HASH_FILE: &str = "catalog.hash";

/// Directory holding bundle payloads.
pub const BUNDLE_DIR: &str = "bundles";

/// Suffix of partially downloaded bundles.
const PART_SUFFIX: &str = ".part";

/// One downloadable bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleEntry {
    /// File name of the bundle, relative to `bundles/`.
    pub name: String,
    /// Exact size in bytes.
    pub size: u64,
}

/// Mapping from labels to the bundles they depend on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    /// Catalog version string.
    pub version: String,
    /// Bundles per label.
    #[serde(default)]
    pub labels: BTreeMap<String, Vec<BundleEntry>>,
}

impl Catalog {
    /// Parses and validates a catalog manifest.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::InvalidData`] on malformed JSON or a bundle
    /// name that is not a plain file name.
    pub fn parse(raw: &[u8]) -> Result<Self, OperationError> {
        let catalog: Self = serde_json::from_slice(raw)
            .map_err(|e| OperationError::InvalidData(format!("catalog manifest: {e}")))?;
        for bundle in catalog.labels.values().flatten() {
            if !is_plain_file_name(&bundle.name) {
                return Err(OperationError::InvalidData(format!(
                    "bundle name '{}' is not a plain file name",
                    bundle.name
                )));
            }
        }
        Ok(catalog)
    }

    /// Bundles for `label`, or `None` if the catalog does not know it.
    #[must_use]
    pub fn bundles_for(&self, label: &Label) -> Option<&[BundleEntry]> {
        self.labels.get(label.as_str()).map(Vec::as_slice)
    }

    /// Summary returned by backend initialization.
    #[must_use]
    pub fn info(&self) -> CatalogInfo {
        CatalogInfo {
            version: Some(self.version.clone()),
            label_count: self.labels.len(),
        }
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.ends_with(PART_SUFFIX)
}

/// Local cache directory holding the catalog and downloaded bundles.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

/// Catalog as persisted in the local store.
#[derive(Debug, Clone)]
pub struct StoredCatalog {
    /// Parsed manifest.
    pub catalog: Catalog,
    /// Version token recorded when the manifest was saved.
    pub hash: Option<String>,
}

impl LocalStore {
    /// Creates a store rooted at `root`. Nothing is touched on disk yet.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final path of a bundle.
    #[must_use]
    pub fn bundle_path(&self, name: &str) -> PathBuf {
        self.root.join(BUNDLE_DIR).join(name)
    }

    /// Temporary path a bundle is streamed to before being moved into place.
    #[must_use]
    pub fn part_path(&self, name: &str) -> PathBuf {
        self.root
            .join(BUNDLE_DIR)
            .join(format!("{name}{PART_SUFFIX}"))
    }

    /// Loads the persisted catalog, if there is one.
    ///
    /// # Errors
    ///
    /// Returns an IO error for unreadable files and
    /// [`OperationError::InvalidData`] for a corrupt manifest.
    pub async fn load(&self) -> Result<Option<StoredCatalog>, OperationError> {
        let catalog_path = self.root.join(CATALOG_FILE);
        let raw = match tokio::fs::read(&catalog_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %catalog_path.display(), "no cached catalog");
                return Ok(None);
            }
            Err(e) => return Err(OperationError::io(&catalog_path, &e)),
        };
        let catalog = Catalog::parse(&raw)?;
        let hash = self.load_hash().await?;
        Ok(Some(StoredCatalog { catalog, hash }))
    }

    /// Reads the persisted version token.
    ///
    /// # Errors
    ///
    /// Returns an IO error for an unreadable token file.
    pub async fn load_hash(&self) -> Result<Option<String>, OperationError> {
        let hash_path = self.root.join(CATALOG_HASH_FILE);
        match tokio::fs::read_to_string(&hash_path).await {
            Ok(raw) => Ok(Some(raw.trim().to_string()).filter(|h| !h.is_empty())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(OperationError::io(&hash_path, &e)),
        }
    }

    /// Persists a raw manifest and its version token.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the directory or files cannot be written.
    pub async fn save(&self, raw_catalog: &[u8], hash: &str) -> Result<(), OperationError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| OperationError::io(&self.root, &e))?;
        let catalog_path = self.root.join(CATALOG_FILE);
        tokio::fs::write(&catalog_path, raw_catalog)
            .await
            .map_err(|e| OperationError::io(&catalog_path, &e))?;
        let hash_path = self.root.join(CATALOG_HASH_FILE);
        tokio::fs::write(&hash_path, hash)
            .await
            .map_err(|e| OperationError::io(&hash_path, &e))?;
        Ok(())
    }

    /// Bundles from `entries` that are absent or have the wrong length.
    pub async fn missing_bundles(&self, entries: &[BundleEntry]) -> Vec<BundleEntry> {
        let mut missing = Vec::new();
        for entry in entries {
            if !self.is_cached(entry).await {
                missing.push(entry.clone());
            }
        }
        missing
    }

    /// Whether the final file for `entry` exists with the catalog length.
    pub async fn is_cached(&self, entry: &BundleEntry) -> bool {
        tokio::fs::metadata(self.bundle_path(&entry.name))
            .await
            .is_ok_and(|meta| meta.is_file() && meta.len() == entry.size)
    }
}
