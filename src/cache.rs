//! Reference-counted cache of loaded assets.
//!
//! [`AssetCache`] is an explicitly owned object: create one per backend and
//! pass it by reference (or `Arc`) to whoever loads assets. Concurrent loads
//! of the same address share a single backend request; every successful
//! [`load`](AssetCache::load) takes one reference that a matching
//! [`release`](AssetCache::release) gives back. The entry is dropped when the
//! last reference goes.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, instrument, warn};

use crate::backend::AssetBackend;
use crate::operation::{OperationError, OperationStatus};

/// Errors raised while loading an asset.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backend refused to schedule the load.
    #[error("asset '{address}' could not be requested")]
    Invalid {
        /// Requested address.
        address: String,
        /// Backend-reported reason.
        #[source]
        source: OperationError,
    },

    /// The load ran and failed.
    #[error("failed to load asset '{address}'")]
    Failed {
        /// Requested address.
        address: String,
        /// Backend-reported reason.
        #[source]
        source: OperationError,
    },

    /// The load succeeded without producing bytes.
    #[error("asset '{address}' loaded without a result")]
    MissingResult {
        /// Requested address.
        address: String,
    },
}

struct CacheEntry {
    value: OnceCell<Arc<Vec<u8>>>,
    refs: AtomicUsize,
}

impl CacheEntry {
    fn new() -> Self {
        Self {
            value: OnceCell::new(),
            refs: AtomicUsize::new(0),
        }
    }
}

/// Load-or-fetch cache keyed by asset address.
pub struct AssetCache {
    backend: Arc<dyn AssetBackend>,
    /// Arc'd entries so the map shard lock is released before awaiting.
    entries: DashMap<String, Arc<CacheEntry>>,
}

impl fmt::Debug for AssetCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssetCache")
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl AssetCache {
    /// Creates an empty cache over `backend`.
    #[must_use]
    pub fn new(backend: Arc<dyn AssetBackend>) -> Self {
        Self {
            backend,
            entries: DashMap::new(),
        }
    }

    /// Returns the cached bytes for `address`, fetching them on first use.
    ///
    /// Takes one reference on success.
    ///
    /// # Errors
    ///
    /// Returns a [`CacheError`] if the backend cannot load the asset. A
    /// failed load takes no reference and leaves nothing cached.
    #[instrument(level = "debug", skip(self))]
    pub async fn load(&self, address: &str) -> Result<Arc<Vec<u8>>, CacheError> {
        // Reserve a reference under the shard lock so a concurrent release
        // cannot drop the entry while this load is in flight.
        let entry = {
            let slot = self
                .entries
                .entry(address.to_string())
                .or_insert_with(|| Arc::new(CacheEntry::new()));
            slot.refs.fetch_add(1, Ordering::SeqCst);
            slot.value().clone()
        };

        match entry.value.get_or_try_init(|| self.fetch(address)).await {
            Ok(bytes) => Ok(Arc::clone(bytes)),
            Err(err) => {
                self.drop_reference(address, &entry);
                Err(err)
            }
        }
    }

    /// Gives back one reference. Returns `false` if `address` is not cached.
    pub fn release(&self, address: &str) -> bool {
        let Some(entry) = self.entries.get(address).map(|slot| slot.value().clone()) else {
            warn!(address, "release of an asset that is not cached");
            return false;
        };
        self.drop_reference(address, &entry);
        true
    }

    /// References currently held on `address`.
    #[must_use]
    pub fn ref_count(&self, address: &str) -> usize {
        self.entries
            .get(address)
            .map_or(0, |slot| slot.refs.load(Ordering::SeqCst))
    }

    /// True if `address` has loaded bytes in the cache.
    #[must_use]
    pub fn contains(&self, address: &str) -> bool {
        self.entries
            .get(address)
            .is_some_and(|slot| slot.value.initialized())
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn drop_reference(&self, address: &str, entry: &CacheEntry) {
        let previous = entry
            .refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        if previous <= 1 {
            let removed = self
                .entries
                .remove_if(address, |_, slot| slot.refs.load(Ordering::SeqCst) == 0);
            if removed.is_some() {
                debug!(address, "evicted asset");
            }
        }
    }

    async fn fetch(&self, address: &str) -> Result<Arc<Vec<u8>>, CacheError> {
        let mut handle = self.backend.load_asset(address);
        if !handle.is_valid() {
            let source = handle.error().unwrap_or(OperationError::Abandoned);
            self.backend.release(handle.release());
            return Err(CacheError::Invalid {
                address: address.to_string(),
                source,
            });
        }

        let result = match handle.wait().await {
            OperationStatus::Succeeded => {
                handle
                    .take_result()
                    .ok_or_else(|| CacheError::MissingResult {
                        address: address.to_string(),
                    })
            }
            OperationStatus::Pending | OperationStatus::Failed => Err(CacheError::Failed {
                address: address.to_string(),
                source: handle.error().unwrap_or(OperationError::Abandoned),
            }),
        };
        self.backend.release(handle.release());
        if let Ok(bytes) = &result {
            debug!(address, bytes = bytes.len(), "asset loaded");
        }
        result
    }
}
