//! Row types read out of the catalog.

use std::str::FromStr;

use wheelsmith_normalize::PackageSlug;
use wheelsmith_types::{CompilationStatus, IndexBackend, WheelMetadata};

/// A backing index this proxy mirrors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    pub id: i64,
    pub slug: String,
    pub url: String,
    pub backend: IndexBackend,
    /// Change-log cursor; `None` until the initial sweep has run.
    pub last_update_serial: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub id: i64,
    pub index_id: i64,
    /// Display form as first observed upstream.
    pub name: String,
    pub slug: PackageSlug,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub id: i64,
    pub package_id: i64,
    /// Normalized PEP 440 form.
    pub version: String,
    /// Upstream artifact URL; sdist preferred, else a universal wheel.
    pub url: String,
    pub md5_digest: String,
}

impl Release {
    pub fn parsed_version(&self) -> Option<pep440_rs::Version> {
        pep440_rs::Version::from_str(&self.version).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub id: i64,
    pub slug: String,
    /// Container driver tag; only `docker` is shipped.
    pub kind: String,
    /// Driver-specific config, e.g. `{"image": "python:3.11"}`.
    pub spec: serde_json::Value,
    /// Captured marker environment, `None` until `capture-env` ran.
    pub environment: Option<serde_json::Value>,
}

impl Platform {
    pub fn image(&self) -> Option<&str> {
        self.spec.get("image").and_then(serde_json::Value::as_str)
    }
}

/// The outcome columns shared by internal and external builds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildRecord {
    pub artifact: Option<String>,
    pub filesize: Option<i64>,
    pub md5_digest: String,
    pub metadata: Option<WheelMetadata>,
    pub build_timestamp: Option<String>,
    pub build_duration: Option<i64>,
    pub build_log: String,
    pub setup_commands: String,
}

impl BuildRecord {
    /// Presence of the artifact is the single truth of "built".
    pub fn is_built(&self) -> bool {
        self.artifact.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Build {
    pub id: i64,
    pub release_id: i64,
    pub platform_id: i64,
    pub record: BuildRecord,
}

/// A build joined with everything needed to address it: its release,
/// package and index. The read side works almost exclusively on this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildDetail {
    pub build: Build,
    pub version: String,
    pub release_url: String,
    pub release_md5: String,
    pub package_name: String,
    pub package_slug: PackageSlug,
    pub index_slug: String,
    pub platform_slug: String,
}

impl BuildDetail {
    /// The filename installers will see: the artifact's basename when
    /// built, else the upstream file's.
    pub fn filename(&self) -> &str {
        let path = self
            .build
            .record
            .artifact
            .as_deref()
            .unwrap_or(&self.release_url);
        let path = path.split(['#', '?']).next().unwrap_or(path);
        path.rsplit('/').next().unwrap_or(path)
    }

    /// The digest to advertise: ours once built, upstream's otherwise.
    pub fn digest(&self) -> &str {
        if self.build.record.is_built() {
            &self.build.record.md5_digest
        } else {
            &self.release_md5
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalBuild {
    pub id: i64,
    pub external_url: String,
    pub platform_id: i64,
    pub record: BuildRecord,
}

/// Which compilation track of a compile job is being updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileTrack {
    Internal,
    Pip,
}

impl CompileTrack {
    pub(crate) fn column_prefix(self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::Pip => "pip",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackState {
    pub status: CompilationStatus,
    pub output: String,
    pub log: String,
    pub timestamp: Option<String>,
    pub duration: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledRequirements {
    pub id: i64,
    pub platform_id: i64,
    pub requirements: String,
    pub index_url: String,
    /// Ordered, as declared in the compile request.
    pub index_slugs: Vec<String>,
    pub created_at: Option<String>,
    pub internal: TrackState,
    pub pip: TrackState,
}

impl CompiledRequirements {
    pub fn track(&self, track: CompileTrack) -> &TrackState {
        match track {
            CompileTrack::Internal => &self.internal,
            CompileTrack::Pip => &self.pip,
        }
    }
}

/// A link-page invalidation owed to the cache after a catalog mutation.
/// The mutation commits first; applying the bump is the caller's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalidation {
    pub index_slug: String,
    pub package_slug: PackageSlug,
}
