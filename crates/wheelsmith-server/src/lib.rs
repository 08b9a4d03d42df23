//! The HTTP front end.
//!
//! Routes dispatch to the catalog, the cache, the scheduler and the
//! resolver; the router itself only canonicalizes path parameters and
//! resolves the (index set, platform) scope.

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use thiserror::Error;
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;

use wheelsmith_builder::{BuilderOptions, DockerDriver, DriverError, WheelBuilder};
use wheelsmith_cache::{CacheBackend, InMemoryBackend, PageCache};
use wheelsmith_catalog::{CatalogError, CatalogStore};
use wheelsmith_dispatch::{BuildScheduler, DynBuilder};
use wheelsmith_storage::{ArtifactStore, StorageDsn, StorageError, open_store};

mod config;
mod error;
mod pages;
mod routes;

pub use config::Config;
pub use error::ServerError;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Bind(#[from] std::io::Error),
}

/// Everything the handlers share. Cheap to clone; construction happens
/// once at startup from [`Config`].
#[derive(Clone)]
pub struct AppState {
    pub catalog: CatalogStore,
    pub cache: PageCache,
    pub storage: Arc<dyn ArtifactStore>,
    pub builder: Arc<DynBuilder>,
    pub scheduler: Arc<BuildScheduler>,
    pub always_redirect_downloads: bool,
}

impl AppState {
    /// Wire the full component graph from configuration, with Docker as
    /// the container driver.
    pub async fn from_config(config: &Config) -> Result<Self, StartupError> {
        let driver = DockerDriver::connect(&config.builds_docker_dsn)?;
        Self::assemble(config, Box::new(driver)).await
    }

    /// Wire the component graph with an explicit driver (tests, other
    /// container backends).
    pub async fn assemble(
        config: &Config,
        driver: Box<dyn wheelsmith_builder::ContainerDriver>,
    ) -> Result<Self, StartupError> {
        let catalog = CatalogStore::connect(&config.catalog_dsn).await?;
        let dsn: StorageDsn = config.builds_storage_dsn.parse()?;
        let storage = open_store(&dsn)?;
        let backend: Arc<dyn CacheBackend> = Arc::new(InMemoryBackend::default());
        let cache = PageCache::new(backend);
        let builder: Arc<DynBuilder> = Arc::new(WheelBuilder::new(
            driver,
            catalog.clone(),
            Arc::clone(&storage),
            BuilderOptions {
                temp_build_root: config.temp_build_root.clone(),
                compile_cache_root: config.compile_cache_root.clone(),
            },
        ));
        let scheduler = Arc::new(BuildScheduler::new(
            catalog.clone(),
            Arc::clone(&builder),
            cache.clone(),
        ));
        Ok(Self {
            catalog,
            cache,
            storage,
            builder,
            scheduler,
            always_redirect_downloads: config.always_redirect_downloads,
        })
    }
}

/// Build the router over the given state.
pub fn router(state: AppState, serve_builds: bool) -> Router {
    let mut router = Router::new()
        .route("/v1/{indexes}/{platform}/+simple/", get(routes::index_root))
        .route(
            "/v1/{indexes}/{platform}/+simple/{package}/",
            get(routes::package_links),
        )
        .route(
            "/v1/{indexes}/{platform}/+simple/{package}/{version}/download/{build_id}/{filename}",
            get(routes::download_build),
        )
        .route(
            "/v1/{indexes}/{platform}/+compile/",
            post(routes::compile_requirements),
        )
        .route(
            "/v1/{indexes}/{platform}/+resolve/",
            post(routes::resolve_requirements),
        );
    if serve_builds {
        router = router.route("/builds/{*path}", get(routes::serve_build));
    }
    router
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until shutdown.
pub async fn serve(config: Config) -> Result<(), StartupError> {
    let state = AppState::from_config(&config).await?;
    let app = router(state, config.serve_builds);
    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    tracing::info!(bind = %config.bind, "serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests;
