//! The production [`DistributionSource`]: candidates from the catalog,
//! builds through the scheduler, dependencies from stored wheel metadata.

use std::sync::Arc;

use async_trait::async_trait;
use pep508_rs::MarkerEnvironment;
use tracing::debug;
use url::Url;

use wheelsmith_catalog::{BuildDetail, CatalogStore, ExternalBuild, Index, Platform};
use wheelsmith_normalize::PackageSlug;
use wheelsmith_resolver::{BuildId, Candidate, DistributionSource, SelectedBuild, SourceError};
use wheelsmith_storage::ArtifactStore;
use wheelsmith_types::EggFragment;

use crate::{BuildRef, BuildScheduler, DispatchError};

pub struct CatalogSource {
    catalog: CatalogStore,
    scheduler: Arc<BuildScheduler>,
    storage: Arc<dyn ArtifactStore>,
    /// Resolved, in declared order.
    indexes: Vec<Index>,
    platform: Platform,
    environment: MarkerEnvironment,
}

impl CatalogSource {
    pub fn new(
        catalog: CatalogStore,
        scheduler: Arc<BuildScheduler>,
        storage: Arc<dyn ArtifactStore>,
        indexes: Vec<Index>,
        platform: Platform,
        environment: MarkerEnvironment,
    ) -> Self {
        Self {
            catalog,
            scheduler,
            storage,
            indexes,
            platform,
            environment,
        }
    }

    fn unavailable(err: impl std::fmt::Display) -> SourceError {
        SourceError::Unavailable {
            message: err.to_string(),
        }
    }

    /// Dependencies of a built wheel, filtered by the requesting node's
    /// extras and the platform environment. A wheel without metadata has
    /// no visible dependencies.
    fn requirements_from(
        &self,
        metadata: Option<&wheelsmith_types::WheelMetadata>,
        extras: &[String],
    ) -> Result<Vec<pep508_rs::Requirement>, SourceError> {
        match metadata {
            Some(metadata) => metadata
                .requirements_for(extras, &self.environment)
                .map_err(Self::unavailable),
            None => Ok(Vec::new()),
        }
    }

    async fn built_detail(
        &self,
        build_id: i64,
        name_for_log: &str,
    ) -> Result<BuildDetail, SourceError> {
        match self
            .scheduler
            .ensure_built(BuildRef::Internal(build_id), false)
            .await
        {
            Ok(()) => {}
            Err(DispatchError::Build(err)) => {
                let log = self
                    .catalog
                    .build_detail(build_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|detail| detail.build.record.build_log)
                    .unwrap_or_else(|| err.to_string());
                return Err(SourceError::BuildFailed {
                    name: name_for_log.to_string(),
                    log,
                });
            }
            Err(err) => return Err(Self::unavailable(err)),
        }
        self.catalog
            .build_detail(build_id)
            .await
            .map_err(Self::unavailable)?
            .ok_or_else(|| Self::unavailable(format!("build {build_id} vanished")))
    }
}

#[async_trait]
impl DistributionSource for CatalogSource {
    async fn candidate_releases(
        &self,
        index: &str,
        package: &PackageSlug,
    ) -> Result<Vec<Candidate>, SourceError> {
        let Some(index) = self.indexes.iter().find(|candidate| candidate.slug == index) else {
            return Ok(Vec::new());
        };
        let Some(package) = self
            .catalog
            .package(index.id, package)
            .await
            .map_err(Self::unavailable)?
        else {
            return Ok(Vec::new());
        };
        let releases = self
            .catalog
            .releases_desc(package.id)
            .await
            .map_err(Self::unavailable)?;
        Ok(releases
            .into_iter()
            .filter_map(|release| {
                let version = release.parsed_version()?;
                Some(Candidate {
                    index_slug: index.slug.clone(),
                    release_id: release.id,
                    version,
                })
            })
            .collect())
    }

    async fn select_build(
        &self,
        candidate: &Candidate,
        extras: &[String],
    ) -> Result<SelectedBuild, SourceError> {
        let build = self
            .catalog
            .get_or_create_build(candidate.release_id, self.platform.id)
            .await
            .map_err(Self::unavailable)?;
        debug!(release = candidate.release_id, build = build.id, "selecting build");
        let detail = self.built_detail(build.id, "release").await?;
        let requires =
            self.requirements_from(detail.build.record.metadata.as_ref(), extras)?;
        Ok(SelectedBuild {
            id: BuildId::Internal(detail.build.id),
            name: detail.package_name.clone(),
            key: detail.package_slug.clone(),
            version: candidate.version.clone(),
            external_url: None,
            artifact_url: detail
                .build
                .record
                .artifact
                .as_deref()
                .and_then(|artifact| self.storage.url(artifact)),
            requires,
        })
    }

    async fn select_url_build(
        &self,
        url: &Url,
        extras: &[String],
    ) -> Result<SelectedBuild, SourceError> {
        let egg = EggFragment::parse(url).map_err(Self::unavailable)?;
        let build = self
            .catalog
            .get_or_create_external_build(url.as_str(), self.platform.id)
            .await
            .map_err(Self::unavailable)?;

        match self
            .scheduler
            .ensure_built(BuildRef::External(build.id), false)
            .await
        {
            Ok(()) => {}
            Err(DispatchError::Build(err)) => {
                let log = self
                    .catalog
                    .external_build(build.id)
                    .await
                    .ok()
                    .flatten()
                    .map(|build| build.record.build_log)
                    .unwrap_or_else(|| err.to_string());
                return Err(SourceError::BuildFailed {
                    name: egg.name.clone(),
                    log,
                });
            }
            Err(err) => return Err(Self::unavailable(err)),
        }

        let built: ExternalBuild = self
            .catalog
            .external_build(build.id)
            .await
            .map_err(Self::unavailable)?
            .ok_or_else(|| Self::unavailable(format!("external build {} vanished", build.id)))?;
        let requires = self.requirements_from(built.record.metadata.as_ref(), extras)?;
        Ok(SelectedBuild {
            id: BuildId::External(built.id),
            name: egg.name.clone(),
            key: egg.slug.clone(),
            version: egg.version.clone(),
            external_url: Some(url.clone()),
            artifact_url: built
                .record
                .artifact
                .as_deref()
                .and_then(|artifact| self.storage.url(artifact)),
            requires,
        })
    }
}
