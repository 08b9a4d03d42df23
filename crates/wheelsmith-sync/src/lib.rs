//! The upstream synchronizer.
//!
//! Two modes: an initial full sweep (enumerate every upstream package,
//! fan imports out over a bounded pool, reconcile deletions, then set the
//! change-log cursor to the serial observed at sweep start) and an
//! incremental drain of the change log from the stored cursor.

use std::collections::BTreeMap;
use std::sync::Arc;

use rustc_hash::FxHashSet;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use wheelsmith_cache::PageCache;
use wheelsmith_catalog::{CatalogError, CatalogStore, DesiredRelease, Index};
use wheelsmith_client::{ClientOptions, IndexClient, UpstreamError};
use wheelsmith_normalize::{InvalidVersion, PackageSlug, normalize_version};
use wheelsmith_storage::ArtifactStore;
use wheelsmith_types::best_release;

mod pool;

pub use pool::WorkerPool;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("index `{slug}` has an invalid URL: {message}")]
    InvalidIndexUrl { slug: String, message: String },

    #[error("index `{slug}` was never initially synced")]
    NotInitialized { slug: String },
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Jobs in flight during the initial sweep.
    pub concurrency: usize,
    /// Package names imported per job.
    pub chunk_size: usize,
    pub client: ClientOptions,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            concurrency: 30,
            chunk_size: 150,
            client: ClientOptions::default(),
        }
    }
}

/// Per-batch result triple: individual failures never abort a sweep.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub succeeded: BTreeMap<String, i64>,
    pub ignored: Vec<String>,
    pub failed: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub imported: usize,
    pub ignored: usize,
    pub deleted: usize,
    pub failed: BTreeMap<String, String>,
    pub last_update_serial: Option<i64>,
}

pub struct Synchronizer {
    catalog: CatalogStore,
    cache: PageCache,
    storage: Arc<dyn ArtifactStore>,
    options: SyncOptions,
}

impl Synchronizer {
    pub fn new(
        catalog: CatalogStore,
        cache: PageCache,
        storage: Arc<dyn ArtifactStore>,
        options: SyncOptions,
    ) -> Self {
        Self {
            catalog,
            cache,
            storage,
            options,
        }
    }

    fn client_for(&self, index: &Index) -> Result<IndexClient, SyncError> {
        let url = Url::parse(&index.url).map_err(|err| SyncError::InvalidIndexUrl {
            slug: index.slug.clone(),
            message: err.to_string(),
        })?;
        Ok(IndexClient::new(index.backend, &url, self.options.client.clone())?)
    }

    /// Synchronize one index: a full sweep when the cursor is unset or
    /// explicitly requested, then an incremental drain either way, since
    /// events keep arriving while a sweep runs.
    pub async fn sync_index(&self, index: &Index, initial: bool) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();
        if initial || index.last_update_serial.is_none() {
            report = self.initial_sweep(index).await?;
        }
        let index = self
            .catalog
            .index_by_slug(&index.slug)
            .await?
            .ok_or_else(|| SyncError::NotInitialized {
                slug: index.slug.clone(),
            })?;
        let incremental = self.itersync(&index).await?;
        report.imported += incremental.imported;
        report.ignored += incremental.ignored;
        report.deleted += incremental.deleted;
        report.failed.extend(incremental.failed);
        report.last_update_serial = incremental.last_update_serial;
        Ok(report)
    }

    /// The full sweep of §4.4.
    async fn initial_sweep(&self, index: &Index) -> Result<SyncReport, SyncError> {
        let client = self.client_for(index)?;

        // Snapshot the serial first: events arriving during the sweep
        // will be replayed by the incremental pass that follows.
        let serial_at_start = client.last_serial().await?;
        info!(index = %index.slug, serial = serial_at_start, "starting initial sweep");

        let names = client.list_packages().await?;
        let mut known: FxHashSet<i64> = self.catalog.package_ids(index.id).await?.into_iter().collect();

        let chunks: Vec<Vec<String>> = names
            .chunks(self.options.chunk_size.max(1))
            .map(<[String]>::to_vec)
            .collect();
        let jobs = chunks
            .into_iter()
            .map(|chunk| self.import_chunk(index, &client, chunk));
        let mut pool = WorkerPool::new(self.options.concurrency, jobs);

        let mut report = SyncReport::default();
        while let Some(outcome) = pool.next().await {
            for (name, package_id) in &outcome.succeeded {
                debug!(index = %index.slug, package = %name, "imported");
                known.remove(package_id);
            }
            report.imported += outcome.succeeded.len();
            report.ignored += outcome.ignored.len();
            for (name, error) in outcome.failed {
                warn!(index = %index.slug, package = %name, "import failed: {error}");
                report.failed.insert(name, error);
            }
        }

        // A sweep that imported nothing from a non-empty listing is an
        // upstream anomaly (an index 404ing everything), not a mass
        // deletion: leave the catalog and the cursor untouched.
        if report.imported == 0 && !names.is_empty() {
            warn!(index = %index.slug, "sweep imported nothing; leaving catalog and cursor untouched");
            return Ok(report);
        }

        // Whatever was not touched no longer exists upstream.
        for orphan in known {
            if let Some((invalidation, artifacts)) = self.catalog.delete_package(orphan).await? {
                self.cache
                    .invalidate(&invalidation.index_slug, &invalidation.package_slug)
                    .await;
                self.delete_artifacts(&artifacts).await;
                report.deleted += 1;
            }
        }

        self.catalog
            .set_last_update_serial(index.id, serial_at_start)
            .await?;
        report.last_update_serial = Some(serial_at_start);
        info!(
            index = %index.slug,
            imported = report.imported,
            deleted = report.deleted,
            "initial sweep finished"
        );
        Ok(report)
    }

    /// Import one chunk of package names, converting per-package errors
    /// into the result triple.
    async fn import_chunk(
        &self,
        index: &Index,
        client: &IndexClient,
        names: Vec<String>,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for name in names {
            match self.import_package(index, client, &name).await {
                Ok(Some(package_id)) => {
                    outcome.succeeded.insert(name, package_id);
                }
                Ok(None) => outcome.ignored.push(name),
                Err(err) => {
                    outcome.failed.insert(name, err.to_string());
                }
            }
        }
        outcome
    }

    /// Drain the change log from the stored cursor. The cursor advances
    /// past an event only once it has been processed, so an aborted drain
    /// resumes where it stopped.
    pub async fn itersync(&self, index: &Index) -> Result<SyncReport, SyncError> {
        let since = index
            .last_update_serial
            .ok_or_else(|| SyncError::NotInitialized {
                slug: index.slug.clone(),
            })?;
        let client = self.client_for(index)?;

        let mut report = SyncReport::default();
        let mut cursor = since;
        let mut stream = client.updates_since(since);
        let drain = loop {
            let event = match stream.next().await {
                Ok(Some(event)) => event,
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            };
            if let Some(name) = &event.package {
                match self.import_package(index, &client, name).await {
                    Ok(Some(_)) => report.imported += 1,
                    Ok(None) => {
                        // Nothing importable is left: drop our mirror.
                        let slug = PackageSlug::new(name);
                        if let Some(package) = self.catalog.package(index.id, &slug).await? {
                            if let Some((invalidation, artifacts)) =
                                self.catalog.delete_package(package.id).await?
                            {
                                self.cache
                                    .invalidate(&invalidation.index_slug, &invalidation.package_slug)
                                    .await;
                                self.delete_artifacts(&artifacts).await;
                                report.deleted += 1;
                            }
                        } else {
                            report.ignored += 1;
                        }
                    }
                    Err(err) => {
                        // Leave the cursor before this event; the next
                        // drain will retry it.
                        warn!(index = %index.slug, package = %name, "sync aborted: {err}");
                        self.catalog.set_last_update_serial(index.id, cursor).await?;
                        return Err(err);
                    }
                }
            }
            if event.serial > cursor {
                cursor = event.serial;
            }
        };

        self.catalog.set_last_update_serial(index.id, cursor).await?;
        report.last_update_serial = Some(cursor);
        drain?;
        Ok(report)
    }

    /// Refresh one package from upstream: fetch its release map, pick the
    /// best artifact per version, reconcile, and invalidate the link
    /// page. `Ok(None)` means no acceptable release remained.
    pub async fn import_package(
        &self,
        index: &Index,
        client: &IndexClient,
        name: &str,
    ) -> Result<Option<i64>, SyncError> {
        let releases = match client.get_package_releases(name).await {
            Ok(releases) => releases,
            Err(UpstreamError::PackageNotFound { .. }) => {
                debug!(index = %index.slug, package = name, "not found upstream");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let mut desired = Vec::new();
        for (version, candidates) in &releases {
            let Some(best) = best_release(candidates) else {
                continue;
            };
            let version = match normalize_version(version) {
                Ok(version) => version,
                Err(InvalidVersion { version, .. }) => {
                    debug!(index = %index.slug, package = name, version, "skipping unparseable version");
                    continue;
                }
            };
            desired.push(DesiredRelease {
                version,
                url: best.url.clone(),
                md5_digest: best.md5_digest.clone(),
            });
        }
        if desired.is_empty() {
            return Ok(None);
        }

        let package = self.catalog.upsert_package(index.id, name).await?;
        let outcome = self.catalog.replace_releases(&package, &desired).await?;
        if outcome.changed {
            self.cache
                .invalidate(&outcome.invalidation.index_slug, &outcome.invalidation.package_slug)
                .await;
            self.delete_artifacts(&outcome.removed_artifacts).await;
        }
        Ok(Some(package.id))
    }

    async fn delete_artifacts(&self, artifacts: &[String]) {
        for artifact in artifacts {
            if let Err(err) = self.storage.delete(artifact).await {
                warn!(artifact, "failed to delete orphaned blob: {err}");
            }
        }
    }
}
