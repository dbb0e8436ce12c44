//! Scripted in-memory asset backend for orchestrator tests.
//!
//! Size queries and downloads complete immediately by default. Switch a kind
//! to manual mode and the backend keeps the reporters so the test decides
//! when, in what order and how each operation completes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bundle_fetch_core::{
    AssetBackend, CatalogId, CatalogInfo, Label, OperationError, OperationHandle, OperationId,
    OperationKind, OperationReporter,
};

#[derive(Default)]
pub struct ScriptedBackend {
    sizes: Mutex<HashMap<String, u64>>,
    pending_catalogs: Mutex<Vec<CatalogId>>,
    invalid_labels: Mutex<HashSet<String>>,
    update_failure: Mutex<Option<OperationError>>,
    unreachable: AtomicBool,
    manual_sizes: AtomicBool,
    manual_downloads: AtomicBool,
    size_reporters: Mutex<HashMap<String, OperationReporter<u64>>>,
    download_reporters: Mutex<HashMap<String, OperationReporter<()>>>,
    issued: Mutex<Vec<(OperationId, OperationKind, Option<String>)>>,
    released: Mutex<Vec<OperationId>>,
    update_calls: Mutex<Vec<Vec<CatalogId>>>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_sizes(entries: &[(&str, u64)]) -> Arc<Self> {
        let backend = Self::default();
        {
            let mut sizes = backend.sizes.lock().unwrap();
            for (label, size) in entries {
                sizes.insert((*label).to_string(), *size);
            }
        }
        Arc::new(backend)
    }

    pub fn set_pending_catalogs(&self, ids: &[&str]) {
        *self.pending_catalogs.lock().unwrap() =
            ids.iter().map(|id| CatalogId::new(*id)).collect();
    }

    pub fn set_invalid_label(&self, label: &str) {
        self.invalid_labels.lock().unwrap().insert(label.to_string());
    }

    pub fn fail_catalog_update(&self, error: OperationError) {
        *self.update_failure.lock().unwrap() = Some(error);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn manual_sizes(&self) {
        self.manual_sizes.store(true, Ordering::SeqCst);
    }

    pub fn auto_sizes(&self) {
        self.manual_sizes.store(false, Ordering::SeqCst);
    }

    pub fn manual_downloads(&self) {
        self.manual_downloads.store(true, Ordering::SeqCst);
    }

    pub fn take_size_reporter(&self, label: &str) -> OperationReporter<u64> {
        self.size_reporters
            .lock()
            .unwrap()
            .remove(label)
            .unwrap_or_else(|| panic!("no pending size query for {label}"))
    }

    pub fn take_download_reporter(&self, label: &str) -> OperationReporter<()> {
        self.download_reporters
            .lock()
            .unwrap()
            .remove(label)
            .unwrap_or_else(|| panic!("no pending download for {label}"))
    }

    pub fn size(&self, label: &str) -> u64 {
        self.sizes.lock().unwrap().get(label).copied().unwrap_or(0)
    }

    /// Waits until `count` manual operations of `kind` are being held.
    pub async fn wait_for_pending(&self, kind: OperationKind, count: usize) {
        for _ in 0..500 {
            let held = match kind {
                OperationKind::SizeQuery => self.size_reporters.lock().unwrap().len(),
                OperationKind::Download => self.download_reporters.lock().unwrap().len(),
                _ => 0,
            };
            if held >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("timed out waiting for {count} pending {kind} operations");
    }

    pub fn issued_count(&self, kind: OperationKind) -> usize {
        self.issued
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .count()
    }

    pub fn issued_labels(&self, kind: OperationKind) -> Vec<String> {
        self.issued
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .filter_map(|(_, _, label)| label.clone())
            .collect()
    }

    pub fn released_ids(&self) -> Vec<OperationId> {
        self.released.lock().unwrap().clone()
    }

    /// Ids of issued operations of `kind` that were released.
    pub fn released_count(&self, kind: OperationKind) -> usize {
        let released = self.released.lock().unwrap();
        self.issued
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, k, _)| *k == kind && released.contains(id))
            .count()
    }

    /// True when every issued operation was released exactly once.
    pub fn all_released_once(&self) -> bool {
        let released = self.released.lock().unwrap();
        let issued = self.issued.lock().unwrap();
        let unique: HashSet<_> = released.iter().collect();
        unique.len() == released.len()
            && issued.len() == released.len()
            && issued.iter().all(|(id, _, _)| unique.contains(id))
    }

    pub fn update_calls(&self) -> Vec<Vec<CatalogId>> {
        self.update_calls.lock().unwrap().clone()
    }

    fn record<T>(&self, handle: &OperationHandle<T>) {
        self.issued.lock().unwrap().push((
            handle.id(),
            handle.kind(),
            handle.label().map(ToString::to_string),
        ));
    }
}

impl AssetBackend for ScriptedBackend {
    fn is_reachable(&self) -> bool {
        !self.unreachable.load(Ordering::SeqCst)
    }

    fn initialize(&self) -> OperationHandle<CatalogInfo> {
        let handle = OperationHandle::completed(
            OperationKind::Initialize,
            None,
            CatalogInfo {
                version: Some("v1".to_string()),
                label_count: self.sizes.lock().unwrap().len(),
            },
        );
        self.record(&handle);
        handle
    }

    fn check_for_catalog_updates(&self) -> OperationHandle<Vec<CatalogId>> {
        let ids = self.pending_catalogs.lock().unwrap().clone();
        let handle = OperationHandle::completed(OperationKind::CatalogCheck, None, ids);
        self.record(&handle);
        handle
    }

    fn update_catalogs(&self, ids: Vec<CatalogId>) -> OperationHandle<()> {
        self.update_calls.lock().unwrap().push(ids);
        let (handle, reporter) = OperationHandle::pending(OperationKind::CatalogUpdate, None);
        self.record(&handle);
        match self.update_failure.lock().unwrap().clone() {
            Some(error) => reporter.fail(error),
            None => {
                self.pending_catalogs.lock().unwrap().clear();
                reporter.succeed(());
            }
        }
        handle
    }

    fn get_download_size(&self, label: &Label) -> OperationHandle<u64> {
        if self.invalid_labels.lock().unwrap().contains(label.as_str()) {
            let handle = OperationHandle::invalid(
                OperationKind::SizeQuery,
                Some(label.clone()),
                OperationError::UnknownLabel(label.to_string()),
            );
            self.record(&handle);
            return handle;
        }
        let (handle, reporter) =
            OperationHandle::pending(OperationKind::SizeQuery, Some(label.clone()));
        self.record(&handle);
        if self.manual_sizes.load(Ordering::SeqCst) {
            self.size_reporters
                .lock()
                .unwrap()
                .insert(label.to_string(), reporter);
        } else {
            reporter.succeed(self.size(label.as_str()));
        }
        handle
    }

    fn download_dependencies(&self, label: &Label) -> OperationHandle<()> {
        if self.invalid_labels.lock().unwrap().contains(label.as_str()) {
            let handle = OperationHandle::invalid(
                OperationKind::Download,
                Some(label.clone()),
                OperationError::UnknownLabel(label.to_string()),
            );
            self.record(&handle);
            return handle;
        }
        let (handle, reporter) =
            OperationHandle::pending(OperationKind::Download, Some(label.clone()));
        self.record(&handle);
        let size = self.size(label.as_str());
        if self.manual_downloads.load(Ordering::SeqCst) {
            reporter.report_progress(0, size);
            self.download_reporters
                .lock()
                .unwrap()
                .insert(label.to_string(), reporter);
        } else {
            reporter.report_progress(size, size);
            reporter.succeed(());
        }
        handle
    }

    fn load_asset(&self, address: &str) -> OperationHandle<Arc<Vec<u8>>> {
        let handle = OperationHandle::completed(
            OperationKind::AssetLoad,
            None,
            Arc::new(address.as_bytes().to_vec()),
        );
        self.record(&handle);
        handle
    }

    fn release(&self, id: OperationId) {
        self.released.lock().unwrap().push(id);
    }
}
