//! Normalization for package names and release versions.
//!
//! Catalog rows, cache keys and resolver nodes are all keyed by the
//! normalized package form, so every lookup has to go through
//! [`PackageSlug`] before comparing anything.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The canonical form of a package name: lowercase, with every run of
/// `.`, `-` and `_` collapsed into a single `-`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageSlug(String);

impl PackageSlug {
    /// Normalize an arbitrary display name into its slug.
    ///
    /// Normalization is idempotent: applying it to an already-normalized
    /// name returns the same slug.
    pub fn new(name: &str) -> Self {
        let mut slug = String::with_capacity(name.len());
        let mut prev_separator = false;
        for char in name.trim().chars() {
            match char {
                '.' | '-' | '_' => {
                    prev_separator = true;
                }
                _ => {
                    if prev_separator {
                        slug.push('-');
                    }
                    prev_separator = false;
                    slug.extend(char.to_lowercase());
                }
            }
        }
        // A trailing separator run still collapses to a `-`.
        if prev_separator {
            slug.push('-');
        }
        Self(slug)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `name` is already in canonical form.
    pub fn is_normalized(name: &str) -> bool {
        Self::new(name).as_str() == name
    }
}

impl Display for PackageSlug {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<PackageSlug> for String {
    fn from(slug: PackageSlug) -> Self {
        slug.0
    }
}

impl FromStr for PackageSlug {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

#[derive(Debug, Error)]
#[error("`{version}` is not a valid PEP 440 version: {message}")]
pub struct InvalidVersion {
    pub version: String,
    pub message: String,
}

/// Canonicalize a version string by round-tripping it through a parsed
/// PEP 440 version. `1.0A1` becomes `1.0a1`, whitespace is dropped, and
/// anything unparseable is rejected.
pub fn normalize_version(version: &str) -> Result<String, InvalidVersion> {
    let parsed = pep440_rs::Version::from_str(version.trim()).map_err(|err| InvalidVersion {
        version: version.to_string(),
        message: err.to_string(),
    })?;
    Ok(parsed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_collapses_separator_runs() {
        assert_eq!(PackageSlug::new("A.B-C_D").as_str(), "a-b-c-d");
        assert_eq!(PackageSlug::new("zope.interface").as_str(), "zope-interface");
        assert_eq!(PackageSlug::new("Django").as_str(), "django");
        assert_eq!(PackageSlug::new("foo---bar").as_str(), "foo-bar");
    }

    #[test]
    fn leading_and_trailing_runs_collapse_to_a_dash() {
        assert_eq!(PackageSlug::new("-foo").as_str(), "-foo");
        assert_eq!(PackageSlug::new("__foo").as_str(), "-foo");
        assert_eq!(PackageSlug::new("foo_").as_str(), "foo-");
        assert_eq!(PackageSlug::new("foo..").as_str(), "foo-");
        assert_eq!(PackageSlug::new("...").as_str(), "-");
    }

    #[test]
    fn slug_is_idempotent() {
        for name in ["A.B-C_D", "requests", "Flask_SQLAlchemy", "x..y", "-foo", "foo_"] {
            let once = PackageSlug::new(name);
            let twice = PackageSlug::new(once.as_str());
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn detects_normalized_names() {
        assert!(PackageSlug::is_normalized("dist-a"));
        assert!(!PackageSlug::is_normalized("Dist_A"));
    }

    #[test]
    fn versions_round_trip_to_canonical_form() {
        assert_eq!(normalize_version("1.0A1").unwrap(), "1.0a1");
        assert_eq!(normalize_version(" 2.0 ").unwrap(), "2.0");
        assert!(normalize_version("not-a-version").is_err());
    }
}
