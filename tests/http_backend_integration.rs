//! Integration tests for the HTTP asset backend.
//!
//! These tests run complete orchestrator passes against a mock HTTP server
//! laid out like a real bundle host.

mod support;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bundle_fetch_core::{
    AssetBackend, DownloadOrchestrator, HttpAssetBackend, HttpBackendOptions, Label, LabelSet,
    OperationError, OperationKind, OrchestratorError, OrchestratorState,
};
use support::socket_guard::{should_skip_socket_bound_test, start_mock_server_or_skip};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MANIFEST: &str = r#"{
    "version": "2024.06",
    "labels": {
        "env": [
            { "name": "env_a.bundle", "size": 4 },
            { "name": "env_b.bundle", "size": 6 }
        ],
        "chars": [ { "name": "chars.bundle", "size": 3 } ]
    }
}"#;

const SHARED_SIZE: usize = 1 << 20;

/// Both labels depend on `shared.bundle`.
fn shared_manifest() -> String {
    format!(
        r#"{{
            "version": "2024.07",
            "labels": {{
                "env": [
                    {{ "name": "env_a.bundle", "size": 4 }},
                    {{ "name": "shared.bundle", "size": {SHARED_SIZE} }}
                ],
                "chars": [ {{ "name": "shared.bundle", "size": {SHARED_SIZE} }} ]
            }}
        }}"#
    )
}

async fn mount_file(server: &MockServer, route: &str, body: &[u8]) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
        .mount(server)
        .await;
}

/// Mounts the catalog plus every bundle of [`MANIFEST`].
async fn mount_layout(server: &MockServer) {
    mount_file(server, "/catalog.hash", b"h1\n").await;
    mount_file(server, "/catalog.json", MANIFEST.as_bytes()).await;
    mount_file(server, "/bundles/env_a.bundle", b"AAAA").await;
    mount_file(server, "/bundles/env_b.bundle", b"BBBBBB").await;
    mount_file(server, "/bundles/chars.bundle", b"CCC").await;
}

fn backend(server: &MockServer, cache_dir: &Path) -> Arc<HttpAssetBackend> {
    let options = HttpBackendOptions::new(
        Url::parse(&server.uri()).expect("mock server uri should parse"),
        cache_dir,
    );
    Arc::new(HttpAssetBackend::new(options).expect("backend should build"))
}

fn orchestrator(backend: &Arc<HttpAssetBackend>, labels: &[&str]) -> DownloadOrchestrator {
    DownloadOrchestrator::new(
        backend.clone(),
        LabelSet::new(labels.iter().copied()).expect("labels should be valid"),
    )
}

/// Answers every connection with a 200 that promises `promised` bytes, sends
/// `sent` of them and then holds the connection open.
async fn start_stalling_server(promised: usize, sent: usize) -> Url {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind stalling server");
    let addr = listener.local_addr().expect("listener should have an address");
    tokio::spawn(async move {
        let mut open = Vec::new();
        while let Ok((mut socket, _)) = listener.accept().await {
            let mut request = [0_u8; 4096];
            let _ = socket.read(&mut request).await;
            let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {promised}\r\n\r\n");
            let _ = socket.write_all(head.as_bytes()).await;
            let _ = socket.write_all(&vec![b'x'; sent]).await;
            let _ = socket.flush().await;
            open.push(socket);
        }
    });
    Url::parse(&format!("http://{addr}/")).expect("stalling server url should parse")
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting until {what}"));
}

// ==================== Full Runs ====================

#[tokio::test]
async fn test_full_run_downloads_every_bundle() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_layout(&server).await;
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let backend = backend(&server, temp_dir.path());
    let orchestrator = orchestrator(&backend, &["env", "chars"]);

    let total = orchestrator
        .start_initialize()
        .await
        .expect("initialize should succeed");
    assert_eq!(total, 13);
    assert_eq!(backend.catalog_version().as_deref(), Some("2024.06"));

    orchestrator
        .start_download()
        .await
        .expect("download should succeed");
    assert_eq!(orchestrator.current_state(), OrchestratorState::FinishDownload);

    let bundles = temp_dir.path().join("bundles");
    assert_eq!(std::fs::read(bundles.join("env_a.bundle")).unwrap(), b"AAAA");
    assert_eq!(std::fs::read(bundles.join("env_b.bundle")).unwrap(), b"BBBBBB");
    assert_eq!(std::fs::read(bundles.join("chars.bundle")).unwrap(), b"CCC");
    assert_eq!(
        std::fs::read_to_string(temp_dir.path().join("catalog.hash")).unwrap(),
        "h1"
    );

    let status = orchestrator.downloading_status();
    assert_eq!(status.downloaded_bytes, 13);
    assert_eq!(status.total_bytes, 13);
    assert!(status.is_done);
    assert_eq!(backend.unreleased_count(), 0, "every operation released");
}

#[tokio::test]
async fn test_second_run_is_up_to_date_without_refetching() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_file(&server, "/catalog.hash", b"h1").await;
    Mock::given(method("GET"))
        .and(path("/catalog.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string(MANIFEST))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/bundles/chars.bundle"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"CCC".to_vec()))
        .expect(1)
        .mount(&server)
        .await;
    let temp_dir = TempDir::new().expect("failed to create temp dir");

    let first = orchestrator(&backend(&server, temp_dir.path()), &["chars"]);
    assert_eq!(first.start_initialize().await.unwrap(), 3);
    first.start_download().await.unwrap();

    let second_backend = backend(&server, temp_dir.path());
    let second = orchestrator(&second_backend, &["chars"]);
    let mut events = second.subscribe();
    assert_eq!(second.start_initialize().await.unwrap(), 0);
    assert_eq!(second_backend.catalog_version().as_deref(), Some("2024.06"));
    assert!(second.pending_catalogs().is_empty());

    second.start_download().await.unwrap();
    assert_eq!(second.current_state(), OrchestratorState::FinishDownload);
    drop(second);
    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
        seen.push(event);
    }
    assert_eq!(seen.len(), 3, "catalog, size and finish events: {seen:?}");
}

#[tokio::test]
async fn test_changed_remote_hash_triggers_catalog_update() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_layout(&server).await;
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    std::fs::write(temp_dir.path().join("catalog.json"), r#"{"version":"old","labels":{}}"#)
        .unwrap();
    std::fs::write(temp_dir.path().join("catalog.hash"), "h0").unwrap();

    let backend = backend(&server, temp_dir.path());
    let orchestrator = orchestrator(&backend, &["env"]);
    assert_eq!(orchestrator.start_initialize().await.unwrap(), 10);
    assert_eq!(backend.catalog_version().as_deref(), Some("2024.06"));
    assert_eq!(
        std::fs::read_to_string(temp_dir.path().join("catalog.hash")).unwrap(),
        "h1"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_labels_sharing_a_bundle_fetch_it_once() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_file(&server, "/catalog.hash", b"h2").await;
    mount_file(&server, "/catalog.json", shared_manifest().as_bytes()).await;
    mount_file(&server, "/bundles/env_a.bundle", b"AAAA").await;
    Mock::given(method("GET"))
        .and(path("/bundles/shared.bundle"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![7_u8; SHARED_SIZE])
                .set_delay(Duration::from_millis(50)),
        )
        .expect(1)
        .mount(&server)
        .await;
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let backend = backend(&server, temp_dir.path());
    let orchestrator = orchestrator(&backend, &["env", "chars"]);

    // Each label's size counts the shared bundle on its own.
    let shared = SHARED_SIZE as u64;
    assert_eq!(orchestrator.start_initialize().await.unwrap(), 4 + 2 * shared);
    orchestrator
        .start_download()
        .await
        .expect("download of shared bundle should succeed");

    let bundles = temp_dir.path().join("bundles");
    assert_eq!(
        std::fs::metadata(bundles.join("shared.bundle")).unwrap().len(),
        shared
    );
    assert!(!bundles.join("shared.bundle.part").exists());
    let status = orchestrator.downloading_status();
    assert!(status.is_done);
    assert_eq!(status.downloaded_bytes, status.total_bytes);
    assert_eq!(backend.unreleased_count(), 0);
}

// ==================== Failures ====================

#[tokio::test]
async fn test_missing_bundle_fails_download_and_cleans_up() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_file(&server, "/catalog.hash", b"h1").await;
    mount_file(&server, "/catalog.json", MANIFEST.as_bytes()).await;
    mount_file(&server, "/bundles/chars.bundle", b"CCC").await;
    Mock::given(method("GET"))
        .and(path("/bundles/env_a.bundle"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let backend = backend(&server, temp_dir.path());
    let orchestrator = orchestrator(&backend, &["chars", "env"]);
    let mut events = orchestrator.subscribe();

    orchestrator.start_initialize().await.unwrap();
    let err = orchestrator.start_download().await.unwrap_err();

    match &err {
        OrchestratorError::OperationFailed { kind, source, .. } => {
            assert_eq!(*kind, OperationKind::Download);
            assert!(matches!(source, OperationError::HttpStatus { status: 404, .. }));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(orchestrator.has_failed());
    assert!(!temp_dir.path().join("bundles/env_a.bundle").exists());
    assert!(!temp_dir.path().join("bundles/env_a.bundle.part").exists());
    assert_eq!(backend.unreleased_count(), 0);

    let mut exceptions = 0;
    while let Ok(event) = events.try_recv() {
        if let bundle_fetch_core::DownloadEvent::Exception(report) = event {
            assert!(report.trace.contains("HTTP 404"));
            exceptions += 1;
        }
    }
    assert_eq!(exceptions, 1);
}

#[tokio::test]
async fn test_truncated_bundle_is_rejected() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_file(&server, "/catalog.hash", b"h1").await;
    mount_file(&server, "/catalog.json", MANIFEST.as_bytes()).await;
    mount_file(&server, "/bundles/chars.bundle", b"CC").await;
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let backend = backend(&server, temp_dir.path());
    let orchestrator = orchestrator(&backend, &["chars"]);

    orchestrator.start_initialize().await.unwrap();
    let err = orchestrator.start_download().await.unwrap_err();
    assert!(matches!(
        err.operation_error(),
        Some(OperationError::InvalidData(_))
    ));
    assert!(!temp_dir.path().join("bundles/chars.bundle").exists());
}

#[tokio::test]
async fn test_oversized_bundle_is_rejected_without_storing() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_file(&server, "/catalog.hash", b"h1").await;
    mount_file(&server, "/catalog.json", MANIFEST.as_bytes()).await;
    mount_file(&server, "/bundles/chars.bundle", &[b'C'; 4096]).await;
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let backend = backend(&server, temp_dir.path());
    let orchestrator = orchestrator(&backend, &["chars"]);

    orchestrator.start_initialize().await.unwrap();
    let err = orchestrator.start_download().await.unwrap_err();
    match err.operation_error() {
        Some(OperationError::InvalidData(message)) => {
            assert!(message.contains("catalog expects 3"), "{message}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!temp_dir.path().join("bundles/chars.bundle").exists());
    assert!(!temp_dir.path().join("bundles/chars.bundle.part").exists());
}

#[tokio::test]
async fn test_released_download_removes_partial_bundle() {
    if should_skip_socket_bound_test() {
        return;
    }
    let base_url = start_stalling_server(1000, 100).await;
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    std::fs::write(
        temp_dir.path().join("catalog.json"),
        r#"{"version":"v1","labels":{"env":[{"name":"big.bundle","size":1000}]}}"#,
    )
    .unwrap();
    let backend = HttpAssetBackend::new(HttpBackendOptions::new(base_url, temp_dir.path()))
        .expect("backend should build");
    let mut init = backend.initialize();
    init.wait().await;
    assert!(init.take_result().is_some());
    backend.release(init.release());

    let handle = backend.download_dependencies(&Label::new("env").unwrap());
    wait_until("part of the bundle arrives", || {
        handle.progress().downloaded_bytes == 100
    })
    .await;
    let part = temp_dir.path().join("bundles/big.bundle.part");
    assert!(part.exists());

    backend.release(handle.release());
    wait_until("the partial bundle is removed", || !part.exists()).await;
    assert!(!temp_dir.path().join("bundles/big.bundle").exists());
    assert_eq!(backend.unreleased_count(), 0);
}

#[tokio::test]
async fn test_catalog_check_server_error_fails_run() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/catalog.hash"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let backend = backend(&server, temp_dir.path());
    let orchestrator = orchestrator(&backend, &["env"]);

    let err = orchestrator.start_initialize().await.unwrap_err();
    assert!(matches!(
        err.operation_error(),
        Some(OperationError::HttpStatus { status: 500, .. })
    ));
    assert_eq!(orchestrator.current_state(), OrchestratorState::CatalogChecking);
}

#[tokio::test]
async fn test_label_missing_from_catalog_is_invalid() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_layout(&server).await;
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let backend = backend(&server, temp_dir.path());
    let orchestrator = orchestrator(&backend, &["env", "ui"]);

    let err = orchestrator.start_initialize().await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::InvalidOperation {
            kind: OperationKind::SizeQuery,
            source: OperationError::UnknownLabel(_),
            ..
        }
    ));
    assert_eq!(backend.unreleased_count(), 0);
}

// ==================== Asset Loading ====================

#[tokio::test]
async fn test_load_asset_reads_downloaded_bundle() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_layout(&server).await;
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let backend = backend(&server, temp_dir.path());
    let orchestrator = orchestrator(&backend, &["env"]);
    orchestrator.start_initialize().await.unwrap();
    orchestrator.start_download().await.unwrap();

    let mut handle = backend.load_asset("env_b.bundle");
    assert!(handle.is_valid());
    handle.wait().await;
    let bytes = handle.take_result().expect("asset should load");
    assert_eq!(bytes.as_slice(), b"BBBBBB");
    backend.release(handle.release());
    assert_eq!(backend.unreleased_count(), 0);

    let mut missing = backend.load_asset("absent.bundle");
    missing.wait().await;
    assert!(matches!(missing.error(), Some(OperationError::Io { .. })));
    backend.release(missing.release());
}
