//! Shared vocabulary types: index backends, upstream release descriptors,
//! structured wheel metadata and `#egg=` URL fragments.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use wheelsmith_normalize::PackageSlug;

mod metadata;

pub use metadata::{MetadataError, RequirementSet, WheelMetadata, parse_metadata_requirement};

/// The upstream protocol spoken by a backing index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackend {
    /// PyPI-style: XML-RPC change log, JSON package detail endpoint.
    Pypi,
    /// devpi-style: JSON change log, JSON package detail endpoint.
    Devpi,
}

impl IndexBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pypi => "pypi",
            Self::Devpi => "devpi",
        }
    }
}

impl Display for IndexBackend {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown index backend `{0}`, expected `pypi` or `devpi`")]
pub struct UnknownBackend(String);

impl FromStr for IndexBackend {
    type Err = UnknownBackend;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pypi" => Ok(Self::Pypi),
            "devpi" => Ok(Self::Devpi),
            other => Err(UnknownBackend(other.to_string())),
        }
    }
}

/// The kind of artifact an upstream file represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseKind {
    Sdist,
    #[serde(rename = "bdist_wheel")]
    Wheel,
    /// Eggs, installers and anything else we never build from.
    Other,
}

impl ReleaseKind {
    /// Classify an artifact by its URL suffix. Used for indexes whose
    /// change feed does not carry an explicit package type.
    pub fn guess_from_url(url: &str) -> Self {
        let path = url.split(['#', '?']).next().unwrap_or(url);
        if path.ends_with(".whl") {
            Self::Wheel
        } else if path.ends_with(".tar.gz")
            || path.ends_with(".tgz")
            || path.ends_with(".tar.bz2")
            || path.ends_with(".zip")
        {
            Self::Sdist
        } else {
            Self::Other
        }
    }

    /// Map a PyPI `packagetype` field.
    pub fn from_packagetype(packagetype: &str) -> Self {
        match packagetype {
            "sdist" => Self::Sdist,
            "bdist_wheel" => Self::Wheel,
            _ => Self::Other,
        }
    }
}

/// One downloadable file of an upstream release, as reported by the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamRelease {
    pub url: String,
    pub md5_digest: String,
    pub kind: ReleaseKind,
}

impl UpstreamRelease {
    /// Whether this is a pure-Python wheel installable on any platform.
    pub fn is_universal_wheel(&self) -> bool {
        self.kind == ReleaseKind::Wheel && self.url.ends_with("-py2.py3-none-any.whl")
    }
}

/// Pick the artifact we mirror for a version: the sdist if there is one,
/// else a universal wheel. Platform-specific wheels are useless to us
/// since we build our own.
pub fn best_release(candidates: &[UpstreamRelease]) -> Option<&UpstreamRelease> {
    candidates
        .iter()
        .find(|release| release.kind == ReleaseKind::Sdist)
        .or_else(|| candidates.iter().find(|release| release.is_universal_wheel()))
}

/// Status of one compilation track on a compile job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompilationStatus {
    #[default]
    Pending,
    Done,
    Failed,
}

impl CompilationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown compilation status `{0}`")]
pub struct UnknownStatus(String);

impl FromStr for CompilationStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum EggFragmentError {
    #[error("`{0}` carries no `#egg=name==version` fragment")]
    Missing(String),
    #[error("`{fragment}` is not a `name==version` egg spec")]
    Malformed { fragment: String },
    #[error("`{version}` in egg fragment is not a valid version: {message}")]
    InvalidVersion { version: String, message: String },
}

/// A URL requirement's identity, parsed out of its `#egg=name==version`
/// fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EggFragment {
    pub url: Url,
    pub name: String,
    pub slug: PackageSlug,
    pub version: pep440_rs::Version,
}

impl EggFragment {
    pub fn parse(url: &Url) -> Result<Self, EggFragmentError> {
        let fragment = url
            .fragment()
            .ok_or_else(|| EggFragmentError::Missing(url.to_string()))?;
        let egg = fragment
            .split('&')
            .find_map(|pair| pair.strip_prefix("egg="))
            .ok_or_else(|| EggFragmentError::Missing(url.to_string()))?;
        let (name, version) = egg
            .split_once("==")
            .ok_or_else(|| EggFragmentError::Malformed {
                fragment: egg.to_string(),
            })?;
        if name.is_empty() || version.is_empty() {
            return Err(EggFragmentError::Malformed {
                fragment: egg.to_string(),
            });
        }
        let parsed =
            pep440_rs::Version::from_str(version).map_err(|err| EggFragmentError::InvalidVersion {
                version: version.to_string(),
                message: err.to_string(),
            })?;
        Ok(Self {
            url: url.clone(),
            name: name.to_string(),
            slug: PackageSlug::new(name),
            version: parsed,
        })
    }
}

impl Display for EggFragment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} @ {}", self.name, self.url)
    }
}
