use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode, header::LOCATION};
use tower::ServiceExt;

use wheelsmith_builder::{BuilderOptions, ContainerDriver, DriverError, RunSpec, WheelBuilder};
use wheelsmith_cache::{InMemoryBackend, PageCache};
use wheelsmith_catalog::{BuildOutcome, CatalogStore, DesiredRelease};
use wheelsmith_dispatch::BuildScheduler;
use wheelsmith_normalize::PackageSlug;
use wheelsmith_storage::FilesystemStore;
use wheelsmith_types::IndexBackend;

use super::*;

/// A driver whose containers run instantly and produce nothing.
struct NullDriver;

#[async_trait]
impl ContainerDriver for NullDriver {
    async fn acquire_image(&self, _image: &str, _log: &mut String) -> Result<(), DriverError> {
        Ok(())
    }

    async fn run(&self, _spec: &RunSpec, log: &mut String) -> Result<i64, DriverError> {
        log.push_str("nothing to do\n");
        Ok(0)
    }
}

struct Harness {
    state: AppState,
    _blobs: tempfile::TempDir,
    _scratch: tempfile::TempDir,
}

async fn harness() -> Harness {
    let catalog = CatalogStore::in_memory().await.unwrap();
    let blobs = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let storage: Arc<dyn wheelsmith_storage::ArtifactStore> = Arc::new(FilesystemStore::new(
        blobs.path().to_path_buf(),
        Some("/builds/".to_string()),
    ));
    let cache = PageCache::new(Arc::new(InMemoryBackend::default()));
    let builder = Arc::new(WheelBuilder::new(
        Box::new(NullDriver) as Box<dyn ContainerDriver>,
        catalog.clone(),
        Arc::clone(&storage),
        BuilderOptions {
            temp_build_root: scratch.path().to_path_buf(),
            compile_cache_root: scratch.path().join("cache"),
        },
    ));
    let scheduler = Arc::new(BuildScheduler::new(
        catalog.clone(),
        Arc::clone(&builder),
        cache.clone(),
    ));
    Harness {
        state: AppState {
            catalog,
            cache,
            storage,
            builder,
            scheduler,
            always_redirect_downloads: false,
        },
        _blobs: blobs,
        _scratch: scratch,
    }
}

impl Harness {
    fn app(&self) -> axum::Router {
        router(self.state.clone(), false)
    }

    async fn seed(&self) -> (i64, i64) {
        let catalog = &self.state.catalog;
        let index = catalog
            .create_index("pypi", "https://upstream.example/pypi", IndexBackend::Pypi)
            .await
            .unwrap();
        let platform = catalog
            .create_platform("linux", "docker", &serde_json::json!({"image": "python:3.11"}))
            .await
            .unwrap();
        catalog
            .set_platform_environment(
                platform.id,
                &serde_json::json!({
                    "implementation_name": "cpython",
                    "implementation_version": "3.11.4",
                    "os_name": "posix",
                    "platform_machine": "x86_64",
                    "platform_python_implementation": "CPython",
                    "platform_release": "",
                    "platform_system": "Linux",
                    "platform_version": "",
                    "python_full_version": "3.11.4",
                    "python_version": "3.11",
                    "sys_platform": "linux"
                }),
            )
            .await
            .unwrap();
        let package = catalog.upsert_package(index.id, "Dist_A").await.unwrap();
        catalog
            .replace_releases(&package, &[DesiredRelease {
                version: "1.0".to_string(),
                url: "https://files/dist-a-1.0.tar.gz".to_string(),
                md5_digest: "aa".to_string(),
            }])
            .await
            .unwrap();
        (index.id, platform.id)
    }

    async fn get(&self, uri: &str) -> (StatusCode, axum::http::HeaderMap, String) {
        let response = self
            .app()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn post(&self, uri: &str, body: &str) -> (StatusCode, String) {
        let response = self
            .app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("host", "proxy.example")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[tokio::test]
async fn unknown_scopes_and_packages_404() {
    let harness = harness().await;
    harness.seed().await;

    let (status, _, _) = harness.get("/v1/nope/linux/+simple/dist-a/").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = harness.get("/v1/pypi/nope/+simple/dist-a/").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = harness.get("/v1/pypi/linux/+simple/no-such-package/").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn link_pages_render_trigger_links_and_create_build_rows() {
    let harness = harness().await;
    let (_, platform_id) = harness.seed().await;

    let (status, headers, body) = harness.get("/v1/pypi/linux/+simple/dist-a/").await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers.get("content-type").unwrap().to_str().unwrap().starts_with("text/html"));
    assert!(body.contains("Links for dist-a"));
    // Not built yet: the link goes through the trigger endpoint.
    assert!(body.contains("/v1/pypi/linux/+simple/dist-a/1.0/download/"));
    assert!(body.contains(">dist-a-1.0.tar.gz</a>"));

    // The page materialized the build row for (release, platform).
    let catalog = &harness.state.catalog;
    let index = catalog.index_by_slug("pypi").await.unwrap().unwrap();
    let package = catalog
        .package(index.id, &PackageSlug::new("dist-a"))
        .await
        .unwrap()
        .unwrap();
    let release = catalog.release(package.id, "1.0").await.unwrap().unwrap();
    let build = catalog.get_or_create_build(release.id, platform_id).await.unwrap();
    assert!(!build.record.is_built());
}

#[tokio::test]
async fn link_pages_are_cached_until_invalidated() {
    let harness = harness().await;
    let (index_id, _) = harness.seed().await;

    let (_, _, first) = harness.get("/v1/pypi/linux/+simple/dist-a/").await;

    // Mutate the catalog without invalidating: the stale page persists.
    let catalog = &harness.state.catalog;
    let package = catalog
        .package(index_id, &PackageSlug::new("dist-a"))
        .await
        .unwrap()
        .unwrap();
    catalog
        .replace_releases(&package, &[
            DesiredRelease {
                version: "1.0".to_string(),
                url: "https://files/dist-a-1.0.tar.gz".to_string(),
                md5_digest: "aa".to_string(),
            },
            DesiredRelease {
                version: "2.0".to_string(),
                url: "https://files/dist-a-2.0.tar.gz".to_string(),
                md5_digest: "bb".to_string(),
            },
        ])
        .await
        .unwrap();

    let (_, _, cached) = harness.get("/v1/pypi/linux/+simple/dist-a/").await;
    assert_eq!(cached, first);

    // `?cache=off` bypasses read and write.
    let (_, _, fresh) = harness.get("/v1/pypi/linux/+simple/dist-a/?cache=off").await;
    assert!(fresh.contains("dist-a-2.0.tar.gz"));
    let (_, _, still_cached) = harness.get("/v1/pypi/linux/+simple/dist-a/").await;
    assert_eq!(still_cached, first);

    // Bumping the serial retires the stale key.
    harness
        .state
        .cache
        .invalidate("pypi", &PackageSlug::new("dist-a"))
        .await;
    let (_, _, invalidated) = harness.get("/v1/pypi/linux/+simple/dist-a/").await;
    assert!(invalidated.contains("dist-a-2.0.tar.gz"));
}

#[tokio::test]
async fn non_canonical_names_redirect_permanently() {
    let harness = harness().await;
    harness.seed().await;

    let (status, headers, _) = harness.get("/v1/pypi/linux/+simple/Dist_A/").await;
    assert_eq!(status, StatusCode::MOVED_PERMANENTLY);
    assert_eq!(
        headers.get(LOCATION).unwrap().to_str().unwrap(),
        "/v1/pypi/linux/+simple/dist-a/"
    );
}

#[tokio::test]
async fn download_trigger_redirects_upstream_until_built() {
    let harness = harness().await;
    let (_, platform_id) = harness.seed().await;
    let catalog = &harness.state.catalog;

    let index = catalog.index_by_slug("pypi").await.unwrap().unwrap();
    let package = catalog
        .package(index.id, &PackageSlug::new("dist-a"))
        .await
        .unwrap()
        .unwrap();
    let release = catalog.release(package.id, "1.0").await.unwrap().unwrap();
    let build = catalog.get_or_create_build(release.id, platform_id).await.unwrap();

    let uri = format!(
        "/v1/pypi/linux/+simple/dist-a/1.0/download/{}/dist-a-1.0.tar.gz",
        build.id
    );
    let (status, headers, _) = harness.get(&uri).await;
    assert_eq!(status, StatusCode::FOUND);
    // The trigger redirect carries no digest fragment.
    assert_eq!(
        headers.get(LOCATION).unwrap().to_str().unwrap(),
        "https://files/dist-a-1.0.tar.gz"
    );

    // Once built, the trigger bounces straight to the artifact.
    catalog
        .record_build_success(build.id, false, &BuildOutcome {
            artifact: "pypi/linux/dist-a/1.0/dist_a-1.0-py3-none-any.whl".to_string(),
            filesize: 4,
            md5_digest: "ff".to_string(),
            metadata: None,
            build_log: String::new(),
            build_timestamp: "2026-01-01T00:00:00Z".to_string(),
            build_duration: 1,
        })
        .await
        .unwrap();
    let (status, headers, _) = harness.get(&uri).await;
    assert_eq!(status, StatusCode::FOUND);
    assert_eq!(
        headers.get(LOCATION).unwrap().to_str().unwrap(),
        "/builds/pypi/linux/dist-a/1.0/dist_a-1.0-py3-none-any.whl"
    );

    let (status, _, _) = harness
        .get("/v1/pypi/linux/+simple/dist-a/1.0/download/9999/x.whl")
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn built_artifacts_link_directly_from_the_page() {
    let harness = harness().await;
    let (_, platform_id) = harness.seed().await;
    let catalog = &harness.state.catalog;

    let index = catalog.index_by_slug("pypi").await.unwrap().unwrap();
    let package = catalog
        .package(index.id, &PackageSlug::new("dist-a"))
        .await
        .unwrap()
        .unwrap();
    let release = catalog.release(package.id, "1.0").await.unwrap().unwrap();
    let build = catalog.get_or_create_build(release.id, platform_id).await.unwrap();
    catalog
        .record_build_success(build.id, false, &BuildOutcome {
            artifact: "pypi/linux/dist-a/1.0/dist_a-1.0-py3-none-any.whl".to_string(),
            filesize: 4,
            md5_digest: "ff".to_string(),
            metadata: None,
            build_log: String::new(),
            build_timestamp: "2026-01-01T00:00:00Z".to_string(),
            build_duration: 1,
        })
        .await
        .unwrap();

    let (_, _, body) = harness.get("/v1/pypi/linux/+simple/dist-a/").await;
    assert!(body.contains("href=\"/builds/pypi/linux/dist-a/1.0/dist_a-1.0-py3-none-any.whl#md5=ff\""));
    assert!(body.contains(">dist_a-1.0-py3-none-any.whl</a>"));
}

#[tokio::test]
async fn compile_answers_with_the_internal_track() {
    let harness = harness().await;
    harness.seed().await;

    // An empty requirements set compiles to just the header.
    let (status, body) = harness.post("/v1/pypi/linux/+compile/", "").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.starts_with("# This file is autogenerated by wheelsmith."));
    assert!(body.contains("pip-reqs -w http://proxy.example/v1/pypi/linux/+simple/ compile"));

    // An unsatisfiable set fails with the compile log as the body.
    let (status, body) = harness.post("/v1/pypi/linux/+compile/", "no-such-dist\n").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("not satisfied"));
}

#[tokio::test]
async fn resolve_turns_pins_into_absolute_urls() {
    let harness = harness().await;
    let (_, platform_id) = harness.seed().await;
    let catalog = &harness.state.catalog;

    let index = catalog.index_by_slug("pypi").await.unwrap().unwrap();
    let package = catalog
        .package(index.id, &PackageSlug::new("dist-a"))
        .await
        .unwrap()
        .unwrap();
    let release = catalog.release(package.id, "1.0").await.unwrap().unwrap();
    let build = catalog.get_or_create_build(release.id, platform_id).await.unwrap();
    catalog
        .record_build_success(build.id, false, &BuildOutcome {
            artifact: "pypi/linux/dist-a/1.0/dist_a-1.0-py3-none-any.whl".to_string(),
            filesize: 4,
            md5_digest: "ff".to_string(),
            metadata: None,
            build_log: String::new(),
            build_timestamp: "2026-01-01T00:00:00Z".to_string(),
            build_duration: 1,
        })
        .await
        .unwrap();

    let (status, body) = harness.post("/v1/pypi/linux/+resolve/", "dist-a==1.0\n").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        "http://proxy.example/builds/pypi/linux/dist-a/1.0/dist_a-1.0-py3-none-any.whl#md5=ff\n"
    );

    // URL requirements resolve through external builds; unbuilt ones
    // pass through while the build runs.
    let (status, body) = harness
        .post("/v1/pypi/linux/+resolve/", "https://ex/pkg-1.2.tar.gz#egg=pkg==1.2\n")
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "https://ex/pkg-1.2.tar.gz#egg=pkg==1.2\n");

    // Unpinned requirements are rejected.
    let (status, _) = harness.post("/v1/pypi/linux/+resolve/", "dist-a>=1.0\n").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Unknown pins are rejected with a message.
    let (status, body) = harness.post("/v1/pypi/linux/+resolve/", "dist-a==9.9\n").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("dist-a==9.9"));
}

#[tokio::test]
async fn serve_builds_route_hands_out_blobs() {
    let harness = harness().await;
    harness
        .state
        .storage
        .save("pypi/linux/dist-a/1.0/a.whl", b"wheel-bytes")
        .await
        .unwrap();

    let app = router(harness.state.clone(), true);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/builds/pypi/linux/dist-a/1.0/a.whl")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"wheel-bytes");

    // Without SERVE_BUILDS the route does not exist.
    let response = router(harness.state.clone(), false)
        .oneshot(
            Request::builder()
                .uri("/builds/pypi/linux/dist-a/1.0/a.whl")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
