//! Lock-file rendering.

use std::collections::BTreeSet;
use std::fmt::Write;

use itertools::Itertools;

use crate::graph::{DependencyGraph, DependencyNode};
use crate::source::DistributionSource;

/// Renders a compiled graph as pinned requirements text: URL requirements
/// first, then alphabetized `name==version` lines with `# via` trailers,
/// with unsafe packages commented out at the end.
#[derive(Debug, Clone)]
pub struct LockFormatter {
    /// Column the `# via` trailer is padded to.
    pub show_parents: usize,
    /// Packages whose pins are emitted commented out.
    pub unsafe_packages: BTreeSet<String>,
    /// Optional leading comment block, one line per entry.
    pub header: Vec<String>,
}

impl Default for LockFormatter {
    fn default() -> Self {
        Self {
            show_parents: 28,
            unsafe_packages: BTreeSet::from(["setuptools".to_string()]),
            header: Vec::new(),
        }
    }
}

impl LockFormatter {
    pub fn format<S: DistributionSource>(&self, graph: &DependencyGraph<'_, S>) -> String {
        let mut out = String::new();
        for line in &self.header {
            if line.is_empty() {
                out.push_str("#\n");
            } else {
                let _ = writeln!(out, "# {line}");
            }
        }

        let mut wrote_external = false;
        for node in graph.nodes().filter(|node| node.is_url()) {
            self.write_node(&mut out, node);
            wrote_external = true;
        }

        let mut unsafe_nodes = Vec::new();
        let ordinary = graph
            .nodes()
            .filter(|node| !node.is_url())
            .sorted_by_key(|node| node.requirement.key.clone());
        for node in ordinary {
            if self.unsafe_packages.contains(node.requirement.key.as_str()) {
                unsafe_nodes.push(node);
                continue;
            }
            if wrote_external {
                wrote_external = false;
                out.push('\n');
            }
            self.write_node(&mut out, node);
        }

        if !unsafe_nodes.is_empty() {
            out.push('\n');
            out.push_str(
                "# The following packages are commented out because they are\n\
                 # considered to be unsafe in a requirements file:\n",
            );
            for node in unsafe_nodes {
                let name = node
                    .build
                    .as_ref()
                    .map_or(node.requirement.name.as_str(), |build| build.name.as_str());
                let _ = writeln!(out, "# {name}");
            }
        }
        out
    }

    fn write_node(&self, out: &mut String, node: &DependencyNode) {
        let mut line = String::new();
        match &node.build {
            Some(build) if build.is_external() => {
                let url = build.external_url.as_ref().expect("external build has a URL");
                let _ = write!(line, "{url}");
            }
            Some(build) => {
                let _ = write!(line, "{}=={}", build.name, build.version);
            }
            None => {
                let _ = write!(line, "{}", node.requirement);
            }
        }

        if self.show_parents > 0 && !node.declared && !node.required_by.is_empty() {
            let parents: BTreeSet<&str> = node
                .required_by
                .iter()
                .map(|citation| citation.name.as_str())
                .collect();
            while line.len() < self.show_parents.saturating_sub(2) {
                line.push(' ');
            }
            let _ = write!(line, "  # via {}", parents.iter().join(", "));
        }
        out.push_str(&line);
        out.push('\n');
    }
}
