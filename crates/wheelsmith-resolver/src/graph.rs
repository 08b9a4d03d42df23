//! The dependency graph and its fixed-point compilation loop.

use std::fmt::Write;

use indexmap::IndexMap;
use pep508_rs::MarkerEnvironment;
use tracing::debug;

use wheelsmith_normalize::PackageSlug;

use crate::requirement::{InputRequirement, MergedRequirement, parse_requirements};
use crate::source::{Candidate, DistributionSource, SelectedBuild};
use crate::ResolveError;

/// A back-reference from a node to a build that cited it. Citations are
/// plain identities, not node pointers, so the graph stays a DAG over
/// nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Citation {
    pub key: PackageSlug,
    pub name: String,
    pub version: pep440_rs::Version,
    pub external: bool,
}

impl Citation {
    fn of(build: &SelectedBuild) -> Self {
        Self {
            key: build.key.clone(),
            name: build.name.clone(),
            version: build.version.clone(),
            external: build.is_external(),
        }
    }
}

#[derive(Debug)]
pub struct DependencyNode {
    pub requirement: MergedRequirement,
    pub build: Option<SelectedBuild>,
    /// Set iff the node came directly from the user input.
    pub declared: bool,
    pub required_by: Vec<Citation>,
}

impl DependencyNode {
    pub fn is_url(&self) -> bool {
        self.requirement.url.is_some()
    }
}

/// The graph: one node per normalized package key, compiled to a fixed
/// point against an ordered index list and a platform environment.
pub struct DependencyGraph<'a, S> {
    source: &'a S,
    indexes: Vec<String>,
    environment: MarkerEnvironment,
    nodes: IndexMap<PackageSlug, DependencyNode>,
    log: String,
}

impl<'a, S> std::fmt::Debug for DependencyGraph<'a, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("indexes", &self.indexes)
            .field("nodes", &self.nodes)
            .field("log", &self.log)
            .finish()
    }
}

impl<'a, S: DistributionSource> DependencyGraph<'a, S> {
    pub fn new(source: &'a S, indexes: Vec<String>, environment: MarkerEnvironment) -> Self {
        Self {
            source,
            indexes,
            environment,
            nodes: IndexMap::new(),
            log: String::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &DependencyNode> {
        self.nodes.values()
    }

    pub fn node(&self, key: &PackageSlug) -> Option<&DependencyNode> {
        self.nodes.get(key)
    }

    /// The compile log, kept for the compile job record.
    pub fn log(&self) -> &str {
        &self.log
    }

    /// Add one line of user input. A requirement whose marker does not
    /// hold for this platform is dropped; markers never survive into the
    /// graph.
    pub fn add_declared(&mut self, input: InputRequirement) -> Result<(), ResolveError> {
        let merged = match input {
            InputRequirement::Spec(requirement) => {
                if !requirement.marker.evaluate(&self.environment, &[]) {
                    let _ = writeln!(self.log, "skipping `{requirement}`: marker does not apply");
                    return Ok(());
                }
                MergedRequirement::from_spec(&requirement)?
            }
            InputRequirement::Url(egg) => MergedRequirement::from_url(egg),
        };
        let key = merged.key.clone();
        self.nodes.insert(key, DependencyNode {
            requirement: merged,
            build: None,
            declared: true,
            required_by: Vec::new(),
        });
        Ok(())
    }

    /// Merge a dependency discovered in a built wheel. Merging into an
    /// existing node clears its selection; it must be re-resolved under
    /// the merged requirement.
    fn update_requirement(
        &mut self,
        merged: MergedRequirement,
        citation: Citation,
    ) -> Result<(), ResolveError> {
        match self.nodes.get_mut(&merged.key) {
            Some(node) => {
                node.requirement.merge(&merged)?;
                node.required_by.push(citation);
                node.build = None;
            }
            None => {
                self.nodes.insert(merged.key.clone(), DependencyNode {
                    requirement: merged,
                    build: None,
                    declared: false,
                    required_by: vec![citation],
                });
            }
        }
        Ok(())
    }

    /// Compile the given requirements text to a fixed point.
    pub async fn compile(&mut self, requirements: &str) -> Result<(), ResolveError> {
        for input in parse_requirements(requirements)? {
            self.add_declared(input)?;
        }
        for round in 1.. {
            let _ = writeln!(self.log, "round {round}");
            debug!(round, nodes = self.nodes.len(), "compile round");
            if !self.compile_round().await? {
                break;
            }
            self.remove_orphans();
        }
        Ok(())
    }

    /// One build round: select a build for every unselected node and fold
    /// in the dependencies of the selected wheels. Returns whether any
    /// node changed.
    async fn compile_round(&mut self) -> Result<bool, ResolveError> {
        let mut tainted = false;
        // Nodes created during this round carry no selection and are
        // picked up by the next round.
        let keys: Vec<PackageSlug> = self.nodes.keys().cloned().collect();
        for key in keys {
            let (extras, url) = {
                let Some(node) = self.nodes.get(&key) else {
                    continue;
                };
                if node.build.is_some() {
                    continue;
                }
                (node.requirement.sorted_extras(), node.requirement.url.clone())
            };
            tainted = true;

            let build = if let Some(egg) = url {
                let _ = writeln!(self.log, "resolving {} from {}", key, egg.url);
                self.source.select_url_build(&egg.url, &extras).await?
            } else {
                let candidate = self.find_best_release(&key).await?;
                let _ = writeln!(
                    self.log,
                    "selected {}=={} from {}",
                    key, candidate.version, candidate.index_slug
                );
                self.source.select_build(&candidate, &extras).await?
            };

            let citation = Citation::of(&build);
            let requires = build.requires.clone();
            if let Some(node) = self.nodes.get_mut(&key) {
                node.build = Some(build);
            }
            for requirement in requires {
                if !requirement.marker.evaluate(&self.environment, &[]) {
                    continue;
                }
                let merged = MergedRequirement::from_spec(&requirement)?;
                let _ = writeln!(self.log, "adding {} via {}", merged, citation.name);
                self.update_requirement(merged, citation.clone())?;
            }
        }
        Ok(tainted)
    }

    /// Scan indexes in declared order, each one's releases newest first,
    /// and take the first version satisfying the node's requirement.
    /// Pre-releases are only eligible when pinned exactly.
    async fn find_best_release(&self, key: &PackageSlug) -> Result<Candidate, ResolveError> {
        let node = &self.nodes[key];
        let requirement = &node.requirement;
        for index in &self.indexes {
            let candidates = self.source.candidate_releases(index, key).await?;
            for candidate in candidates {
                if candidate.version.any_prerelease() && !requirement.pins_exactly(&candidate.version)
                {
                    continue;
                }
                if requirement.specifiers.contains(&candidate.version) {
                    return Ok(candidate);
                }
            }
        }
        Err(ResolveError::Unsatisfied {
            requirement: requirement.to_string(),
        })
    }

    /// Drop citations whose build left the selection, then nodes nothing
    /// requires, to a fixed point.
    fn remove_orphans(&mut self) {
        loop {
            let mut retained: Vec<(PackageSlug, Vec<Citation>)> = Vec::new();
            for (key, node) in &self.nodes {
                let live: Vec<Citation> = node
                    .required_by
                    .iter()
                    .filter(|citation| self.citation_live(citation))
                    .cloned()
                    .collect();
                if live.len() != node.required_by.len() {
                    retained.push((key.clone(), live));
                }
            }

            let mut removed = false;
            for (key, live) in retained {
                let node = self.nodes.get_mut(&key).expect("node exists");
                node.required_by = live;
            }
            let orphaned: Vec<PackageSlug> = self
                .nodes
                .iter()
                .filter(|(_, node)| !node.declared && node.required_by.is_empty())
                .map(|(key, _)| key.clone())
                .collect();
            for key in orphaned {
                let _ = writeln!(self.log, "dropping orphaned {key}");
                self.nodes.shift_remove(&key);
                removed = true;
            }
            if !removed {
                break;
            }
        }
    }

    /// Whether a citing build is still part of the current selection: its
    /// node exists and either has no selection yet or selects the cited
    /// version. URL-backed citations only need their node to exist, since
    /// URL nodes are never replaced.
    fn citation_live(&self, citation: &Citation) -> bool {
        let Some(node) = self.nodes.get(&citation.key) else {
            return false;
        };
        match &node.build {
            None => true,
            Some(build) => citation.external || build.version == citation.version,
        }
    }
}
