//! Structured wheel metadata, as found in `*.dist-info/metadata.json`.

use std::str::FromStr;

use pep508_rs::{MarkerEnvironment, MarkerTree, Requirement};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use wheelsmith_normalize::PackageSlug;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("invalid requirement `{requirement}` in wheel metadata: {message}")]
    InvalidRequirement { requirement: String, message: String },
    #[error("invalid environment marker `{marker}` in wheel metadata: {message}")]
    InvalidMarker { marker: String, message: String },
}

/// One conditional group of requirements from the metadata document.
///
/// A group applies when its `extra` (if any) was requested and its
/// `environment` marker (if any) holds for the target platform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default)]
    pub requires: Vec<String>,
}

/// The subset of a wheel's `metadata.json` that the resolver consumes.
/// Unknown fields are preserved nowhere; we only ever read this.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WheelMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run_requires: Vec<RequirementSet>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub meta_requires: Vec<RequirementSet>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extras: Vec<String>,
}

impl WheelMetadata {
    /// The dependencies that apply for the given extras on the given
    /// platform, parsed into requirements.
    pub fn requirements_for(
        &self,
        extras: &[String],
        environment: &MarkerEnvironment,
    ) -> Result<Vec<Requirement>, MetadataError> {
        let wanted: Vec<PackageSlug> = extras.iter().map(|extra| PackageSlug::new(extra)).collect();

        let mut requirements = Vec::new();
        for set in self.run_requires.iter().chain(&self.meta_requires) {
            if let Some(extra) = &set.extra {
                if !wanted.contains(&PackageSlug::new(extra)) {
                    continue;
                }
            }
            if let Some(marker) = &set.environment {
                let tree = MarkerTree::from_str(marker).map_err(|err| {
                    MetadataError::InvalidMarker {
                        marker: marker.clone(),
                        message: err.to_string(),
                    }
                })?;
                if !tree.evaluate(environment, &[]) {
                    continue;
                }
            }
            for requirement in &set.requires {
                requirements.push(parse_metadata_requirement(requirement)?);
            }
        }
        Ok(requirements)
    }
}

/// Parse a requirement string as it appears in wheel metadata.
///
/// Metadata 2.0 documents write specifiers in the parenthesized form
/// (`requests (>=2.8.1)`), which is valid PEP 508, but some producers emit
/// bare `name >= version` pairs; both parse directly. The paren-stripping
/// retry covers documents that put illegal whitespace inside the parens.
pub fn parse_metadata_requirement(requirement: &str) -> Result<Requirement, MetadataError> {
    match Requirement::from_str(requirement) {
        Ok(parsed) => Ok(parsed),
        Err(first_err) => {
            let stripped = requirement.replace(['(', ')'], " ");
            Requirement::from_str(stripped.trim()).map_err(|_| MetadataError::InvalidRequirement {
                requirement: requirement.to_string(),
                message: first_err.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pep508_rs::MarkerEnvironmentBuilder;

    fn linux_env() -> MarkerEnvironment {
        MarkerEnvironment::try_from(MarkerEnvironmentBuilder {
            implementation_name: "cpython",
            implementation_version: "3.11.4",
            os_name: "posix",
            platform_machine: "x86_64",
            platform_python_implementation: "CPython",
            platform_release: "",
            platform_system: "Linux",
            platform_version: "",
            python_full_version: "3.11.4",
            python_version: "3.11",
            sys_platform: "linux",
        })
        .unwrap()
    }

    fn metadata(json: &str) -> WheelMetadata {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn parses_parenthesized_specifiers() {
        let requirement = parse_metadata_requirement("requests (>=2.8.1)").unwrap();
        assert_eq!(requirement.name.as_ref(), "requests");
    }

    #[test]
    fn plain_requirements_always_apply() {
        let meta = metadata(
            r#"{
                "name": "dist-a",
                "version": "1.0",
                "run_requires": [{"requires": ["dist-c"]}]
            }"#,
        );
        let requirements = meta.requirements_for(&[], &linux_env()).unwrap();
        assert_eq!(requirements.len(), 1);
        assert_eq!(requirements[0].name.as_ref(), "dist-c");
    }

    #[test]
    fn extra_groups_require_the_extra() {
        let meta = metadata(
            r#"{
                "name": "dist-a",
                "version": "1.0",
                "run_requires": [
                    {"requires": ["base-dep"]},
                    {"extra": "Security", "requires": ["extra-dep"]}
                ]
            }"#,
        );
        let env = linux_env();

        let without = meta.requirements_for(&[], &env).unwrap();
        assert_eq!(without.len(), 1);

        let with = meta
            .requirements_for(&["security".to_string()], &env)
            .unwrap();
        assert_eq!(with.len(), 2);
        assert_eq!(with[1].name.as_ref(), "extra-dep");
    }

    #[test]
    fn environment_groups_evaluate_markers() {
        let meta = metadata(
            r#"{
                "name": "dist-a",
                "version": "1.0",
                "run_requires": [
                    {"environment": "sys_platform == 'win32'", "requires": ["win-dep"]},
                    {"environment": "sys_platform == 'linux'", "requires": ["linux-dep"]}
                ]
            }"#,
        );
        let requirements = meta.requirements_for(&[], &linux_env()).unwrap();
        assert_eq!(requirements.len(), 1);
        assert_eq!(requirements[0].name.as_ref(), "linux-dep");
    }
}
