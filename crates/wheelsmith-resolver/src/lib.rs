//! The dependency resolver: a multi-index, platform-aware graph compiler
//! that turns loose requirements into a pinned, orphan-free lock file.

use thiserror::Error;

mod formatter;
mod graph;
mod requirement;
mod source;

pub use formatter::LockFormatter;
pub use graph::{Citation, DependencyGraph, DependencyNode};
pub use requirement::{
    InputRequirement, MergedRequirement, parse_requirements, split_requirement_lines,
};
pub use source::{BuildId, Candidate, DistributionSource, SelectedBuild, SourceError};

#[derive(Debug, Error)]
pub enum ResolveError {
    /// No index carries a release satisfying the merged requirement.
    #[error("dependency not satisfied: {requirement}")]
    Unsatisfied { requirement: String },

    /// Two requirements for one key cannot coexist.
    #[error("conflicting requirements for `{key}`: {message}")]
    MergeConflict { key: String, message: String },

    #[error("invalid requirement `{line}`: {message}")]
    InvalidRequirement { line: String, message: String },

    #[error(transparent)]
    Source(#[from] SourceError),
}
