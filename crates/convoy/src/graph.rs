//! The package dependency graph: forward and reverse edges over a set of
//! packages, validated and topologically ordered at construction time.
//!
//! The graph is immutable for the lifetime of one execution. Construction
//! rejects edges to unknown packages and dependency cycles; the
//! deterministic topological order computed here doubles as the run's build
//! order.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::types::PackageInfo;

/// Immutable DAG over packages. Forward edges map a package to its
/// dependencies, reverse edges to its dependents; the two are consistent by
/// construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageGraph {
    packages: BTreeMap<String, PackageInfo>,
    edges: BTreeMap<String, BTreeSet<String>>,
    reverse_edges: BTreeMap<String, BTreeSet<String>>,
    build_order: Vec<String>,
}

impl PackageGraph {
    /// Build and validate a graph from package descriptions.
    ///
    /// Fails when a declared dependency names an unknown package, or when
    /// the dependency relation contains a cycle.
    pub fn new(packages: impl IntoIterator<Item = PackageInfo>) -> Result<Self> {
        let packages: BTreeMap<String, PackageInfo> = packages
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();

        let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut reverse_edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for name in packages.keys() {
            edges.insert(name.clone(), BTreeSet::new());
            reverse_edges.insert(name.clone(), BTreeSet::new());
        }

        for (name, info) in &packages {
            for dep in &info.dependencies {
                if !packages.contains_key(dep) {
                    bail!("package {name} depends on unknown package {dep}");
                }
                edges.get_mut(name).expect("edge entry").insert(dep.clone());
                reverse_edges
                    .get_mut(dep)
                    .expect("reverse edge entry")
                    .insert(name.clone());
            }
        }

        let build_order = topo_order(&packages, &edges, &reverse_edges)?;

        Ok(Self {
            packages,
            edges,
            reverse_edges,
            build_order,
        })
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.packages.contains_key(name)
    }

    pub fn package(&self, name: &str) -> Option<&PackageInfo> {
        self.packages.get(name)
    }

    pub fn packages(&self) -> &BTreeMap<String, PackageInfo> {
        &self.packages
    }

    /// Direct dependencies of `name`.
    pub fn dependencies_of(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.edges.get(name)
    }

    /// Direct dependents of `name`.
    pub fn dependents_of(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.reverse_edges.get(name)
    }

    /// The closure of reverse edges starting at `name`, excluding `name`
    /// itself.
    pub fn transitive_dependents(&self, name: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(name);

        while let Some(current) = queue.pop_front() {
            if let Some(dependents) = self.reverse_edges.get(current) {
                for dependent in dependents {
                    if out.insert(dependent.clone()) {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        out.remove(name);
        out
    }

    /// Deterministic dependency-respecting order over all packages:
    /// dependencies always precede dependents, ties break by name.
    pub fn build_order(&self) -> &[String] {
        &self.build_order
    }

    /// Construct without validation. Tests use this to observe how the
    /// engine behaves on graphs that violate the acyclicity invariant.
    #[cfg(test)]
    pub(crate) fn from_parts_unchecked(
        packages: BTreeMap<String, PackageInfo>,
        edges: BTreeMap<String, BTreeSet<String>>,
        reverse_edges: BTreeMap<String, BTreeSet<String>>,
    ) -> Self {
        let build_order = packages.keys().cloned().collect();
        Self {
            packages,
            edges,
            reverse_edges,
            build_order,
        }
    }
}

/// Kahn's algorithm with a name-sorted ready set so the order is stable
/// across runs.
fn topo_order(
    packages: &BTreeMap<String, PackageInfo>,
    edges: &BTreeMap<String, BTreeSet<String>>,
    reverse_edges: &BTreeMap<String, BTreeSet<String>>,
) -> Result<Vec<String>> {
    let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
    for name in packages.keys() {
        let deps = edges.get(name.as_str()).map(BTreeSet::len).unwrap_or(0);
        indegree.insert(name, deps);
    }

    let mut ready: BTreeSet<&str> = indegree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(name, _)| *name)
        .collect();

    let mut out: Vec<String> = Vec::with_capacity(packages.len());

    while let Some(&name) = ready.iter().next() {
        ready.remove(name);
        out.push(name.to_string());

        if let Some(dependents) = reverse_edges.get(name) {
            for dependent in dependents {
                let deg = indegree
                    .get_mut(dependent.as_str())
                    .expect("known package must have indegree");
                *deg = deg.saturating_sub(1);
                if *deg == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    if out.len() != packages.len() {
        let stuck: Vec<&str> = indegree
            .iter()
            .filter(|(_, deg)| **deg > 0)
            .map(|(name, _)| *name)
            .collect();
        bail!("dependency cycle detected among: {}", stuck.join(", "));
    }

    Ok(out)
}
