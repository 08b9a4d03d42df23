//! Requirement parsing and merging.
//!
//! Nodes in the dependency graph carry a [`MergedRequirement`]: the
//! combination of every requirement seen for one package key. Markers are
//! resolved against the platform environment before anything reaches a
//! node, so merging only deals with extras, specifier sets and URLs.

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use pep440_rs::{Operator, Version, VersionSpecifier, VersionSpecifiers};
use pep508_rs::{Requirement, VersionOrUrl};
use url::Url;

use wheelsmith_normalize::PackageSlug;
use wheelsmith_types::EggFragment;

use crate::ResolveError;

fn no_specifiers() -> VersionSpecifiers {
    VersionSpecifiers::from_iter(std::iter::empty::<VersionSpecifier>())
}

/// One line of user input: a PEP 508 requirement or a bare artifact URL
/// with an `#egg=name==version` fragment.
#[derive(Debug, Clone)]
pub enum InputRequirement {
    Spec(Requirement),
    Url(EggFragment),
}

/// Split requirement text into logical lines: blank lines and comment
/// lines dropped, trailing ` #` comments stripped, `\` continuations
/// joined.
pub fn split_requirement_lines(text: &str) -> Vec<String> {
    let mut logical = Vec::new();
    let mut pending = String::new();
    for raw in text.lines() {
        let mut line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(cut) = line.find(" #") {
            line = line[..cut].trim_end();
        }
        if let Some(stripped) = line.strip_suffix('\\') {
            pending.push_str(stripped.trim_end());
            pending.push(' ');
            continue;
        }
        if pending.is_empty() {
            logical.push(line.to_string());
        } else {
            pending.push_str(line);
            logical.push(std::mem::take(&mut pending));
        }
    }
    if !pending.is_empty() {
        logical.push(pending.trim_end().to_string());
    }
    logical
}

/// Parse requirement text into input requirements.
pub fn parse_requirements(text: &str) -> Result<Vec<InputRequirement>, ResolveError> {
    let mut requirements = Vec::new();
    for line in split_requirement_lines(text) {
        if line.starts_with("http://") || line.starts_with("https://") {
            let url = Url::parse(&line).map_err(|err| ResolveError::InvalidRequirement {
                line: line.clone(),
                message: err.to_string(),
            })?;
            let egg = EggFragment::parse(&url).map_err(|err| ResolveError::InvalidRequirement {
                line: line.clone(),
                message: err.to_string(),
            })?;
            requirements.push(InputRequirement::Url(egg));
        } else {
            let parsed =
                Requirement::from_str(&line).map_err(|err| ResolveError::InvalidRequirement {
                    line: line.clone(),
                    message: err.to_string(),
                })?;
            requirements.push(InputRequirement::Spec(parsed));
        }
    }
    Ok(requirements)
}

/// The merged requirement state of one graph node.
#[derive(Debug, Clone)]
pub struct MergedRequirement {
    /// Display form of the name as first seen.
    pub name: String,
    pub key: PackageSlug,
    pub extras: BTreeSet<String>,
    pub specifiers: VersionSpecifiers,
    pub url: Option<EggFragment>,
}

impl MergedRequirement {
    /// Lift a marker-free PEP 508 requirement. A URL requirement must
    /// carry an egg fragment naming the same package.
    pub fn from_spec(requirement: &Requirement) -> Result<Self, ResolveError> {
        let name = requirement.name.to_string();
        let key = PackageSlug::new(&name);
        let extras: BTreeSet<String> =
            requirement.extras.iter().map(ToString::to_string).collect();
        let (specifiers, url) = match &requirement.version_or_url {
            None => (no_specifiers(), None),
            Some(VersionOrUrl::VersionSpecifier(specifiers)) => (specifiers.clone(), None),
            Some(VersionOrUrl::Url(verbatim)) => {
                let egg = EggFragment::parse(&verbatim.to_url()).map_err(|err| {
                    ResolveError::InvalidRequirement {
                        line: requirement.to_string(),
                        message: err.to_string(),
                    }
                })?;
                if egg.slug != key {
                    return Err(ResolveError::InvalidRequirement {
                        line: requirement.to_string(),
                        message: format!("egg fragment names `{}`", egg.name),
                    });
                }
                (no_specifiers(), Some(egg))
            }
        };
        Ok(Self {
            name,
            key,
            extras,
            specifiers,
            url,
        })
    }

    pub fn from_url(egg: EggFragment) -> Self {
        Self {
            name: egg.name.clone(),
            key: egg.slug.clone(),
            extras: BTreeSet::new(),
            specifiers: no_specifiers(),
            url: Some(egg),
        }
    }

    /// Merge another requirement for the same key: extras union,
    /// specifier intersection (by accumulation), URL preservation.
    pub fn merge(&mut self, other: &MergedRequirement) -> Result<(), ResolveError> {
        debug_assert_eq!(self.key, other.key);
        self.extras.extend(other.extras.iter().cloned());

        let mut combined: Vec<VersionSpecifier> = self.specifiers.iter().cloned().collect();
        for specifier in other.specifiers.iter() {
            if !combined.contains(specifier) {
                combined.push(specifier.clone());
            }
        }
        self.specifiers = VersionSpecifiers::from_iter(combined);

        match (&self.url, &other.url) {
            (Some(ours), Some(theirs)) if ours.url != theirs.url => {
                return Err(ResolveError::MergeConflict {
                    key: self.key.to_string(),
                    message: format!(
                        "two distinct URLs: `{}` and `{}`",
                        ours.url, theirs.url
                    ),
                });
            }
            (None, Some(theirs)) => self.url = Some(theirs.clone()),
            _ => {}
        }

        if let Some(egg) = &self.url {
            if !self.specifiers.contains(&egg.version) {
                return Err(ResolveError::MergeConflict {
                    key: self.key.to_string(),
                    message: format!(
                        "pinned URL version {} violates specifier `{}`",
                        egg.version, self.specifiers
                    ),
                });
            }
        }
        Ok(())
    }

    /// Whether the requirement explicitly pins this exact version with
    /// `==` (or `===`). Pre-releases are only eligible through such a pin.
    pub fn pins_exactly(&self, version: &Version) -> bool {
        self.specifiers.iter().any(|specifier| {
            matches!(specifier.operator(), Operator::Equal | Operator::ExactEqual)
                && specifier.version() == version
        })
    }

    pub fn sorted_extras(&self) -> Vec<String> {
        self.extras.iter().cloned().collect()
    }
}

impl Display for MergedRequirement {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)?;
        if !self.extras.is_empty() {
            write!(f, "[{}]", self.sorted_extras().join(","))?;
        }
        if let Some(egg) = &self.url {
            write!(f, " @ {}", egg.url)?;
        } else {
            let specifiers = self.specifiers.to_string();
            if !specifiers.is_empty() {
                write!(f, "{specifiers}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn merged(line: &str) -> MergedRequirement {
        MergedRequirement::from_spec(&Requirement::from_str(line).unwrap()).unwrap()
    }

    #[test]
    fn splits_continuations_and_comments() {
        let lines = split_requirement_lines(
            "# a comment\n\
             dist-a>=1.0 # trailing\n\
             \n\
             dist-b \\\n\
             >=2.0\n",
        );
        assert_eq!(lines, vec!["dist-a>=1.0".to_string(), "dist-b >=2.0".to_string()]);
    }

    #[test]
    fn parses_bare_urls_with_egg_fragments() {
        let parsed = parse_requirements("https://ex/pkg-1.2.tar.gz#egg=pkg==1.2\n").unwrap();
        assert!(matches!(&parsed[0], InputRequirement::Url(egg) if egg.name == "pkg"));

        assert!(matches!(
            parse_requirements("https://ex/pkg-1.2.tar.gz\n"),
            Err(ResolveError::InvalidRequirement { .. })
        ));
    }

    #[test]
    fn merging_unions_extras_and_intersects_specifiers() {
        let mut left = merged("dist-a[security]>=1.0");
        let right = merged("dist-a[tests]<2.0");
        left.merge(&right).unwrap();

        assert_eq!(left.sorted_extras(), vec!["security".to_string(), "tests".to_string()]);
        assert!(left.specifiers.contains(&Version::from_str("1.5").unwrap()));
        assert!(!left.specifiers.contains(&Version::from_str("2.0").unwrap()));
        assert!(!left.specifiers.contains(&Version::from_str("0.9").unwrap()));
    }

    #[test]
    fn distinct_urls_for_one_key_conflict() {
        let one = Url::parse("https://ex/pkg-1.2.tar.gz#egg=pkg==1.2").unwrap();
        let two = Url::parse("https://other/pkg-1.3.tar.gz#egg=pkg==1.3").unwrap();
        let mut left = MergedRequirement::from_url(EggFragment::parse(&one).unwrap());
        let right = MergedRequirement::from_url(EggFragment::parse(&two).unwrap());
        assert!(matches!(
            left.merge(&right),
            Err(ResolveError::MergeConflict { .. })
        ));
    }

    #[test]
    fn url_pin_must_satisfy_merged_specifiers() {
        let url = Url::parse("https://ex/pkg-1.2.tar.gz#egg=pkg==1.2").unwrap();
        let mut node = MergedRequirement::from_url(EggFragment::parse(&url).unwrap());
        // Compatible constraint merges fine.
        node.merge(&merged("pkg>=1.0")).unwrap();
        // An incompatible constraint is fatal.
        assert!(matches!(
            node.merge(&merged("pkg>=2.0")),
            Err(ResolveError::MergeConflict { .. })
        ));
    }

    #[test]
    fn exact_pins_allow_prereleases() {
        let requirement = merged("dist-a==1.0a1");
        assert!(requirement.pins_exactly(&Version::from_str("1.0a1").unwrap()));
        assert!(!requirement.pins_exactly(&Version::from_str("1.0").unwrap()));
        assert!(!merged("dist-a>=1.0a1").pins_exactly(&Version::from_str("1.0a1").unwrap()));
    }
}
