//! HTTP asset backend over a static file layout.
//!
//! Serves the orchestrator from a plain HTTP server (or CDN) laid out as
//! described in [`super::catalog`], caching the catalog and bundles in a
//! local directory. Each request spawns one tokio task; releasing the handle
//! aborts the task if it is still running.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::StreamExt;
use reqwest::Client;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::catalog::{BundleEntry, CATALOG_FILE, CATALOG_HASH_FILE, Catalog, LocalStore};
use super::{AssetBackend, CatalogId, CatalogInfo};
use crate::labels::Label;
use crate::operation::{
    OperationError, OperationHandle, OperationId, OperationKind, OperationReporter,
};

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes for large bundles).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Errors raised while constructing the backend.
#[derive(Debug, thiserror::Error)]
pub enum HttpBackendError {
    /// The base URL cannot serve as a directory root.
    #[error("invalid base URL {url}: must be an absolute http(s) URL")]
    InvalidBaseUrl {
        /// The rejected URL.
        url: String,
    },

    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Construction options for [`HttpAssetBackend`].
#[derive(Debug, Clone)]
pub struct HttpBackendOptions {
    /// Root URL of the remote layout.
    pub base_url: Url,
    /// Local cache directory.
    pub cache_dir: PathBuf,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Whole-request timeout in seconds.
    pub read_timeout_secs: u64,
}

impl HttpBackendOptions {
    /// Options with default timeouts.
    #[must_use]
    pub fn new(base_url: Url, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_url,
            cache_dir: cache_dir.into(),
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            read_timeout_secs: READ_TIMEOUT_SECS,
        }
    }
}

/// Asset backend fetching catalogs and bundles over HTTP.
#[derive(Debug)]
pub struct HttpAssetBackend {
    client: Client,
    base_url: Url,
    store: LocalStore,
    catalog: Arc<RwLock<Option<Catalog>>>,
    tasks: DashMap<OperationId, AbortHandle>,
    /// One lock per bundle name so labels sharing a bundle fetch it once.
    bundle_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl HttpAssetBackend {
    /// Creates a backend. No network or disk access happens until the first request.
    ///
    /// # Errors
    ///
    /// Returns [`HttpBackendError::InvalidBaseUrl`] for non-http(s) URLs and
    /// [`HttpBackendError::Client`] if the HTTP client cannot be built.
    #[instrument(level = "debug", skip(options), fields(base_url = %options.base_url))]
    pub fn new(options: HttpBackendOptions) -> Result<Self, HttpBackendError> {
        let base_url = normalize_base_url(options.base_url)?;
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(options.connect_timeout_secs))
            .timeout(Duration::from_secs(options.read_timeout_secs))
            .gzip(true)
            .user_agent(concat!("bundle-fetch/", env!("CARGO_PKG_VERSION")))
            .build()?;

        debug!(
            cache_dir = %options.cache_dir.display(),
            connect_timeout_secs = options.connect_timeout_secs,
            read_timeout_secs = options.read_timeout_secs,
            "creating HTTP asset backend"
        );

        Ok(Self {
            client,
            base_url,
            store: LocalStore::new(options.cache_dir),
            catalog: Arc::new(RwLock::new(None)),
            tasks: DashMap::new(),
            bundle_locks: Arc::new(DashMap::new()),
        })
    }

    /// Number of issued operations not yet released.
    #[must_use]
    pub fn unreleased_count(&self) -> usize {
        self.tasks.len()
    }

    /// Currently loaded catalog version, if any.
    #[must_use]
    pub fn catalog_version(&self) -> Option<String> {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|c| c.version.clone())
    }

    fn label_bundles(&self, label: &Label) -> Result<Vec<BundleEntry>, OperationError> {
        let guard = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
        let Some(catalog) = guard.as_ref() else {
            return Err(OperationError::Unavailable(
                "no catalog loaded; initialize and update catalogs first".to_string(),
            ));
        };
        catalog
            .bundles_for(label)
            .map(<[BundleEntry]>::to_vec)
            .ok_or_else(|| OperationError::UnknownLabel(label.to_string()))
    }

    fn spawn_operation<T, F, Fut>(
        &self,
        kind: OperationKind,
        label: Option<Label>,
        work: F,
    ) -> OperationHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(OperationReporter<T>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return OperationHandle::invalid(
                kind,
                label,
                OperationError::Unavailable("no async runtime available".to_string()),
            );
        };
        let (handle, reporter) = OperationHandle::pending(kind, label);
        let join = runtime.spawn(work(reporter));
        self.tasks.insert(handle.id(), join.abort_handle());
        debug!(id = %handle.id(), %kind, "operation issued");
        handle
    }
}

fn normalize_base_url(mut url: Url) -> Result<Url, HttpBackendError> {
    if !matches!(url.scheme(), "http" | "https") || url.cannot_be_a_base() {
        return Err(HttpBackendError::InvalidBaseUrl {
            url: url.to_string(),
        });
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn settle<T>(reporter: OperationReporter<T>, result: Result<T, OperationError>) {
    match result {
        Ok(value) => reporter.succeed(value),
        Err(error) => {
            warn!(id = %reporter.id(), error = %error, "operation failed");
            reporter.fail(error);
        }
    }
}

fn join_url(base: &Url, relative: &str) -> Result<Url, OperationError> {
    base.join(relative)
        .map_err(|e| OperationError::InvalidData(format!("cannot build URL for {relative}: {e}")))
}

async fn send(client: &Client, url: &Url) -> Result<reqwest::Response, OperationError> {
    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|e| OperationError::Network(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(OperationError::HttpStatus {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(response)
}

async fn fetch_bytes(client: &Client, url: &Url) -> Result<Vec<u8>, OperationError> {
    let response = send(client, url).await?;
    let body = response
        .bytes()
        .await
        .map_err(|e| OperationError::Network(e.to_string()))?;
    Ok(body.to_vec())
}

fn set_catalog(slot: &RwLock<Option<Catalog>>, catalog: Catalog) {
    *slot.write().unwrap_or_else(PoisonError::into_inner) = Some(catalog);
}

impl AssetBackend for HttpAssetBackend {
    fn initialize(&self) -> OperationHandle<CatalogInfo> {
        let store = self.store.clone();
        let slot = Arc::clone(&self.catalog);
        self.spawn_operation(OperationKind::Initialize, None, |reporter| async move {
            settle(reporter, load_cached_catalog(&store, &slot).await);
        })
    }

    fn check_for_catalog_updates(&self) -> OperationHandle<Vec<CatalogId>> {
        let url = match join_url(&self.base_url, CATALOG_HASH_FILE) {
            Ok(url) => url,
            Err(e) => return OperationHandle::invalid(OperationKind::CatalogCheck, None, e),
        };
        let client = self.client.clone();
        let store = self.store.clone();
        self.spawn_operation(OperationKind::CatalogCheck, None, |reporter| async move {
            settle(reporter, check_remote_hash(&client, &url, &store).await);
        })
    }

    fn update_catalogs(&self, ids: Vec<CatalogId>) -> OperationHandle<()> {
        let Some(target) = ids.last().cloned() else {
            return OperationHandle::completed(OperationKind::CatalogUpdate, None, ());
        };
        let url = match join_url(&self.base_url, CATALOG_FILE) {
            Ok(url) => url,
            Err(e) => return OperationHandle::invalid(OperationKind::CatalogUpdate, None, e),
        };
        let client = self.client.clone();
        let store = self.store.clone();
        let slot = Arc::clone(&self.catalog);
        self.spawn_operation(OperationKind::CatalogUpdate, None, |reporter| async move {
            let result = fetch_catalog(&client, &url, &store, &target, &slot).await;
            settle(reporter, result);
        })
    }

    fn get_download_size(&self, label: &Label) -> OperationHandle<u64> {
        let bundles = match self.label_bundles(label) {
            Ok(bundles) => bundles,
            Err(e) => {
                return OperationHandle::invalid(OperationKind::SizeQuery, Some(label.clone()), e);
            }
        };
        let store = self.store.clone();
        self.spawn_operation(
            OperationKind::SizeQuery,
            Some(label.clone()),
            |reporter| async move {
                let missing = store.missing_bundles(&bundles).await;
                let size = missing
                    .iter()
                    .fold(0_u64, |acc, b| acc.saturating_add(b.size));
                settle(reporter, Ok(size));
            },
        )
    }

    fn download_dependencies(&self, label: &Label) -> OperationHandle<()> {
        let bundles = match self.label_bundles(label) {
            Ok(bundles) => bundles,
            Err(e) => {
                return OperationHandle::invalid(OperationKind::Download, Some(label.clone()), e);
            }
        };
        let client = self.client.clone();
        let store = self.store.clone();
        let base_url = self.base_url.clone();
        let locks = Arc::clone(&self.bundle_locks);
        let label_name = label.to_string();
        self.spawn_operation(
            OperationKind::Download,
            Some(label.clone()),
            |reporter| async move {
                let target = BundleTarget {
                    client: &client,
                    store: &store,
                    base_url: &base_url,
                    locks: &locks,
                };
                let result = download_bundles(&target, &bundles, &reporter).await;
                if result.is_ok() {
                    info!(label = %label_name, "label dependencies downloaded");
                }
                settle(reporter, result);
            },
        )
    }

    fn load_asset(&self, address: &str) -> OperationHandle<Arc<Vec<u8>>> {
        if address.is_empty() || address.contains(['/', '\\']) || address == ".." {
            return OperationHandle::invalid(
                OperationKind::AssetLoad,
                None,
                OperationError::InvalidData(format!("asset address '{address}' is not a bundle name")),
            );
        }
        let path = self.store.bundle_path(address);
        self.spawn_operation(OperationKind::AssetLoad, None, |reporter| async move {
            let result = tokio::fs::read(&path)
                .await
                .map(Arc::new)
                .map_err(|e| OperationError::io(&path, &e));
            settle(reporter, result);
        })
    }

    fn release(&self, id: OperationId) {
        if let Some((_, task)) = self.tasks.remove(&id) {
            if !task.is_finished() {
                debug!(%id, "aborting in-flight operation on release");
            }
            task.abort();
        }
    }
}

/// Loads the persisted catalog into `slot`.
async fn load_cached_catalog(
    store: &LocalStore,
    slot: &RwLock<Option<Catalog>>,
) -> Result<CatalogInfo, OperationError> {
    let Some(stored) = store.load().await? else {
        info!(cache_dir = %store.root().display(), "starting without a cached catalog");
        return Ok(CatalogInfo::default());
    };
    let info = stored.catalog.info();
    info!(version = %stored.catalog.version, "loaded cached catalog");
    set_catalog(slot, stored.catalog);
    Ok(info)
}

/// Compares the remote version token with the persisted one.
async fn check_remote_hash(
    client: &Client,
    url: &Url,
    store: &LocalStore,
) -> Result<Vec<CatalogId>, OperationError> {
    let raw = fetch_bytes(client, url).await?;
    let remote = String::from_utf8_lossy(&raw).trim().to_string();
    if remote.is_empty() {
        return Err(OperationError::InvalidData(
            "remote catalog hash is empty".to_string(),
        ));
    }
    let local = store.load_hash().await?;
    if local.as_deref() == Some(remote.as_str()) {
        debug!(hash = %remote, "catalog is current");
        Ok(Vec::new())
    } else {
        info!(remote = %remote, local = ?local, "catalog update available");
        Ok(vec![CatalogId::new(remote)])
    }
}

async fn fetch_catalog(
    client: &Client,
    url: &Url,
    store: &LocalStore,
    target: &CatalogId,
    slot: &RwLock<Option<Catalog>>,
) -> Result<(), OperationError> {
    let raw = fetch_bytes(client, url).await?;
    let catalog = Catalog::parse(&raw)?;
    store.save(&raw, target.as_str()).await?;
    info!(version = %catalog.version, id = %target, "catalog updated");
    set_catalog(slot, catalog);
    Ok(())
}

/// Where and how bundles are fetched and stored.
struct BundleTarget<'a> {
    client: &'a Client,
    store: &'a LocalStore,
    base_url: &'a Url,
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
}

impl BundleTarget<'_> {
    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        // Clone the Arc so the shard lock is released before awaiting.
        Arc::clone(self.locks.entry(name.to_string()).or_default().value())
    }
}

/// Streams every missing bundle into the local store, publishing byte progress.
///
/// Bundles shared with another label are fetched by whichever operation
/// takes the bundle lock first; the other one finds the final file in place.
async fn download_bundles(
    target: &BundleTarget<'_>,
    bundles: &[BundleEntry],
    reporter: &OperationReporter<()>,
) -> Result<(), OperationError> {
    let missing = target.store.missing_bundles(bundles).await;
    let total = missing
        .iter()
        .fold(0_u64, |acc, b| acc.saturating_add(b.size));
    reporter.report_progress(0, total);
    if missing.is_empty() {
        return Ok(());
    }

    let bundle_dir = target.store.bundle_path("");
    tokio::fs::create_dir_all(&bundle_dir)
        .await
        .map_err(|e| OperationError::io(&bundle_dir, &e))?;

    let mut completed: u64 = 0;
    for bundle in &missing {
        if reporter.is_released() {
            return Err(OperationError::Abandoned);
        }
        let lock = target.lock_for(&bundle.name);
        let _fetching = lock.lock().await;
        if target.store.is_cached(bundle).await {
            debug!(bundle = %bundle.name, "bundle already stored by another operation");
        } else {
            fetch_bundle(target, bundle, |bytes| {
                reporter.report_progress(completed.saturating_add(bytes), total);
            })
            .await?;
        }
        completed = completed.saturating_add(bundle.size);
        reporter.report_progress(completed, total);
    }
    Ok(())
}

async fn fetch_bundle(
    target: &BundleTarget<'_>,
    bundle: &BundleEntry,
    on_progress: impl FnMut(u64),
) -> Result<(), OperationError> {
    let url = join_url(target.base_url, &format!("bundles/{}", bundle.name))?;
    let part = PartFile::new(target.store.part_path(&bundle.name));
    let written =
        stream_bundle(target.client, &url, part.path(), bundle.size, on_progress).await?;
    if written != bundle.size {
        return Err(OperationError::InvalidData(format!(
            "bundle {} is {written} bytes, catalog expects {}",
            bundle.name, bundle.size
        )));
    }
    part.commit(&target.store.bundle_path(&bundle.name)).await?;
    debug!(bundle = %bundle.name, bytes = written, "bundle stored");
    Ok(())
}

/// Partially written bundle. Removed on drop unless moved into place,
/// which also covers tasks aborted mid-stream.
struct PartFile {
    path: PathBuf,
    committed: bool,
}

impl PartFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: false,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn commit(mut self, final_path: &Path) -> Result<(), OperationError> {
        tokio::fs::rename(&self.path, final_path)
            .await
            .map_err(|e| OperationError::io(final_path, &e))?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed partial bundle"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to remove partial bundle");
            }
        }
    }
}

/// Streams `url` into `part_path`, refusing bodies longer than `expected`.
async fn stream_bundle(
    client: &Client,
    url: &Url,
    part_path: &Path,
    expected: u64,
    mut on_progress: impl FnMut(u64),
) -> Result<u64, OperationError> {
    let oversized = |len: u64| {
        OperationError::InvalidData(format!(
            "{url} sent at least {len} bytes, catalog expects {expected}"
        ))
    };
    let response = send(client, url).await?;
    if let Some(len) = response.content_length() {
        if len > expected {
            return Err(oversized(len));
        }
    }
    let file = File::create(part_path)
        .await
        .map_err(|e| OperationError::io(part_path, &e))?;
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| OperationError::Network(e.to_string()))?;
        written = written.saturating_add(chunk.len() as u64);
        if written > expected {
            return Err(oversized(written));
        }
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| OperationError::io(part_path, &e))?;
        on_progress(written);
    }

    writer
        .flush()
        .await
        .map_err(|e| OperationError::io(part_path, &e))?;
    Ok(written)
}
