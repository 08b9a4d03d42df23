//! Dispatch: the build scheduler and the resolver's production
//! [`DistributionSource`], wired over the catalog, the builder, the blob
//! store and the link-page cache.

use std::sync::Arc;

use dashmap::DashMap;
use pep508_rs::MarkerEnvironment;
use thiserror::Error;
use tracing::{debug, info, warn};

use wheelsmith_builder::{BuildError, ContainerDriver, WheelBuilder};
use wheelsmith_cache::PageCache;
use wheelsmith_catalog::{
    CatalogError, CatalogStore, CompileTrack, CompiledRequirements, Index, Platform, TrackUpdate,
};
use wheelsmith_resolver::{DependencyGraph, LockFormatter, ResolveError};
use wheelsmith_storage::ArtifactStore;
use wheelsmith_types::CompilationStatus;

mod source;

pub use source::CatalogSource;

/// The builder as dispatched: driver chosen at startup.
pub type DynBuilder = WheelBuilder<Box<dyn ContainerDriver>>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("{what} {id} does not exist")]
    NotFound { what: &'static str, id: i64 },

    #[error("platform `{platform}` has no captured environment")]
    EnvironmentMissing { platform: String },
}

/// Which build row a job addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildRef {
    Internal(i64),
    External(i64),
}

/// Dispatches build jobs with at most one in flight per (release,
/// platform), or per (URL, platform), at a time.
///
/// Coalescing policy: a second caller for the same key waits on the
/// first and then observes its result through the re-checked build row,
/// so no duplicate container ever starts.
pub struct BuildScheduler {
    catalog: CatalogStore,
    builder: Arc<DynBuilder>,
    cache: PageCache,
    // Keyed locks live for the process lifetime; the key space is the
    // set of build rows ever touched, which stays small.
    locks: DashMap<BuildRef, Arc<tokio::sync::Mutex<()>>>,
}

impl BuildScheduler {
    pub fn new(catalog: CatalogStore, builder: Arc<DynBuilder>, cache: PageCache) -> Self {
        Self {
            catalog,
            builder,
            cache,
            locks: DashMap::new(),
        }
    }

    /// Build now unless an artifact already exists (or `force`), waiting
    /// out any in-flight build of the same key first.
    pub async fn ensure_built(&self, build: BuildRef, force: bool) -> Result<(), DispatchError> {
        let lock = self
            .locks
            .entry(build)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        match build {
            BuildRef::Internal(id) => {
                let detail = self
                    .catalog
                    .build_detail(id)
                    .await?
                    .ok_or(DispatchError::NotFound { what: "build", id })?;
                if !force && detail.build.record.is_built() {
                    debug!(build = id, "already built; coalesced or cached");
                    return Ok(());
                }
                let platform = self
                    .catalog
                    .platform_by_id(detail.build.platform_id)
                    .await?
                    .ok_or(DispatchError::NotFound {
                        what: "platform",
                        id: detail.build.platform_id,
                    })?;
                self.builder.build(&detail, &platform).await?;
                self.cache
                    .invalidate(&detail.index_slug, &detail.package_slug)
                    .await;
            }
            BuildRef::External(id) => {
                let external = self
                    .catalog
                    .external_build(id)
                    .await?
                    .ok_or(DispatchError::NotFound {
                        what: "external build",
                        id,
                    })?;
                if !force && external.record.is_built() {
                    debug!(build = id, "already built; coalesced or cached");
                    return Ok(());
                }
                let platform = self
                    .catalog
                    .platform_by_id(external.platform_id)
                    .await?
                    .ok_or(DispatchError::NotFound {
                        what: "platform",
                        id: external.platform_id,
                    })?;
                self.builder.build_external(&external, &platform).await?;
            }
        }
        Ok(())
    }

    /// Fire-and-forget build used by the download-trigger path: the
    /// request redirects to the upstream artifact while this runs.
    pub fn schedule(self: &Arc<Self>, build: BuildRef, force: bool) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = scheduler.ensure_built(build, force).await {
                warn!(?build, "scheduled build failed: {err}");
            }
        });
    }
}

/// Parse a platform's captured environment for marker evaluation.
pub fn platform_environment(platform: &Platform) -> Result<MarkerEnvironment, DispatchError> {
    let raw = platform
        .environment
        .as_ref()
        .ok_or_else(|| DispatchError::EnvironmentMissing {
            platform: platform.slug.clone(),
        })?;
    serde_json::from_value(raw.clone()).map_err(|_| DispatchError::EnvironmentMissing {
        platform: platform.slug.clone(),
    })
}

/// Run the internal compilation track of a compile job and record its
/// outcome. Returns the reloaded row; the caller reads the track state.
pub async fn run_internal_compile(
    catalog: &CatalogStore,
    scheduler: &Arc<BuildScheduler>,
    storage: &Arc<dyn ArtifactStore>,
    compiled_id: i64,
) -> Result<CompiledRequirements, DispatchError> {
    let compiled = catalog
        .compiled_requirements(compiled_id)
        .await?
        .ok_or(DispatchError::NotFound {
            what: "compile job",
            id: compiled_id,
        })?;
    let platform = catalog
        .platform_by_id(compiled.platform_id)
        .await?
        .ok_or(DispatchError::NotFound {
            what: "platform",
            id: compiled.platform_id,
        })?;
    let indexes: Vec<Index> = catalog
        .indexes_by_slugs(&compiled.index_slugs)
        .await?
        .unwrap_or_default();
    let environment = platform_environment(&platform)?;

    let started = std::time::Instant::now();
    let source = CatalogSource::new(
        catalog.clone(),
        Arc::clone(scheduler),
        Arc::clone(storage),
        indexes,
        platform,
        environment.clone(),
    );
    let mut graph = DependencyGraph::new(
        &source,
        compiled.index_slugs.clone(),
        environment,
    );
    let result = graph.compile(&compiled.requirements).await;
    let duration = started.elapsed().as_secs() as i64;

    let update = match &result {
        Ok(()) => {
            let formatter = LockFormatter {
                header: vec![
                    "This file is autogenerated by wheelsmith.".to_string(),
                    "Make changes in requirements.in, then submit it to the".to_string(),
                    "proxy to update:".to_string(),
                    String::new(),
                    format!("    pip-reqs -w {} compile", compiled.index_url),
                    String::new(),
                ],
                ..LockFormatter::default()
            };
            info!(compiled_id, "internal compile finished");
            TrackUpdate {
                status: CompilationStatus::Done,
                output: formatter.format(&graph),
                log: graph.log().to_string(),
                duration,
            }
        }
        Err(err) => {
            warn!(compiled_id, "internal compile failed: {err}");
            let mut log = graph.log().to_string();
            log.push_str(&format!("error: {err}\n"));
            TrackUpdate {
                status: CompilationStatus::Failed,
                output: String::new(),
                log,
                duration,
            }
        }
    };
    catalog
        .finish_compile_track(compiled_id, CompileTrack::Internal, &update)
        .await?;

    catalog
        .compiled_requirements(compiled_id)
        .await?
        .ok_or(DispatchError::NotFound {
            what: "compile job",
            id: compiled_id,
        })
}
