//! The seam between the graph compiler and the rest of the system.
//!
//! The graph never touches the catalog, the builder or the blob store
//! directly; it asks a [`DistributionSource`] for candidate releases and
//! for selected (built) wheels. Production wires this over the catalog
//! and the build scheduler; tests use an in-memory source.

use async_trait::async_trait;
use pep440_rs::Version;
use thiserror::Error;
use url::Url;

use wheelsmith_normalize::PackageSlug;

#[derive(Debug, Error)]
pub enum SourceError {
    /// A wheel build failed while the resolver waited on it. The log is
    /// carried for the compile record.
    #[error("building `{name}` failed")]
    BuildFailed { name: String, log: String },

    #[error("{message}")]
    Unavailable { message: String },
}

/// A release eligible for selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub index_slug: String,
    pub release_id: i64,
    pub version: Version,
}

/// Identity of a build row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildId {
    Internal(i64),
    External(i64),
}

/// A selected, built wheel: enough to cite it, list its dependencies and
/// emit its download URL.
#[derive(Debug, Clone)]
pub struct SelectedBuild {
    pub id: BuildId,
    /// Display name of the owning package.
    pub name: String,
    pub key: PackageSlug,
    pub version: Version,
    /// Set for external builds only.
    pub external_url: Option<Url>,
    /// Where installers download the wheel.
    pub artifact_url: Option<String>,
    /// The wheel's dependencies, already filtered by the requesting
    /// node's extras and the platform environment.
    pub requires: Vec<pep508_rs::Requirement>,
}

impl SelectedBuild {
    pub fn is_external(&self) -> bool {
        self.external_url.is_some()
    }
}

#[async_trait]
pub trait DistributionSource: Send + Sync {
    /// The releases of `package` on `index`, newest version first.
    async fn candidate_releases(
        &self,
        index: &str,
        package: &PackageSlug,
    ) -> Result<Vec<Candidate>, SourceError>;

    /// Resolve a candidate into a built wheel, building it synchronously
    /// if its artifact is missing.
    async fn select_build(
        &self,
        candidate: &Candidate,
        extras: &[String],
    ) -> Result<SelectedBuild, SourceError>;

    /// Resolve a URL requirement into a built external wheel.
    async fn select_url_build(
        &self,
        url: &Url,
        extras: &[String],
    ) -> Result<SelectedBuild, SourceError>;
}
