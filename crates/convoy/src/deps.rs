//! Pure readiness and shape queries over `(graph, state)`.
//!
//! Nothing here mutates anything: the pool and the recovery manager call
//! these predicates and apply the transitions themselves.

use std::collections::{BTreeSet, HashMap};

use crate::graph::PackageGraph;
use crate::state::ExecutionState;

/// True iff every direct dependency of `name` is satisfied — completed, or
/// skipped because it legitimately had nothing to do — and none has failed.
/// Packages skipped by cascade or by an operator do NOT satisfy readiness.
pub fn is_ready(graph: &PackageGraph, state: &ExecutionState, name: &str) -> bool {
    let Some(deps) = graph.dependencies_of(name) else {
        return false;
    };

    deps.iter().all(|dep| {
        !state.failed.contains_key(dep)
            && (state.completed.contains(dep) || state.skipped_no_changes.contains_key(dep))
    })
}

/// Number of direct dependents of `name`.
pub fn dependent_count(graph: &PackageGraph, name: &str) -> usize {
    graph.dependents_of(name).map(BTreeSet::len).unwrap_or(0)
}

/// Longest path from `name` down to any leaf; leaves are 0.
///
/// Memoised within the call. The graph invariant forbids cycles, but a
/// cycle that slips through yields 0 for its members instead of looping.
pub fn depth(graph: &PackageGraph, name: &str) -> usize {
    let mut memo: HashMap<String, usize> = HashMap::new();
    let mut visiting: BTreeSet<String> = BTreeSet::new();
    let mut cyclic: BTreeSet<String> = BTreeSet::new();
    let d = depth_inner(graph, name, &mut memo, &mut visiting, &mut cyclic);
    if cyclic.contains(name) { 0 } else { d }
}

fn depth_inner(
    graph: &PackageGraph,
    name: &str,
    memo: &mut HashMap<String, usize>,
    visiting: &mut BTreeSet<String>,
    cyclic: &mut BTreeSet<String>,
) -> usize {
    if let Some(&d) = memo.get(name) {
        return d;
    }
    if !visiting.insert(name.to_string()) {
        // Already on the path below us: cycle.
        cyclic.insert(name.to_string());
        return 0;
    }

    let d = graph
        .dependencies_of(name)
        .map(|deps| {
            deps.iter()
                .map(|dep| depth_inner(graph, dep, memo, visiting, cyclic))
                .max()
                .map(|m| m + 1)
                .unwrap_or(0)
        })
        .unwrap_or(0);

    visiting.remove(name);
    memo.insert(name.to_string(), d);
    d
}

/// All packages that transitively depend on `name`, excluding `name`.
pub fn transitive_dependents(graph: &PackageGraph, name: &str) -> BTreeSet<String> {
    graph.transitive_dependents(name)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::types::PackageInfo;

    use super::*;

    fn pkg(name: &str, deps: &[&str]) -> PackageInfo {
        PackageInfo::new(
            name,
            "1.0.0",
            format!("/w/{name}"),
            deps.iter().map(|d| d.to_string()),
        )
    }

    fn diamond() -> PackageGraph {
        PackageGraph::new(vec![
            pkg("a", &["b", "c"]),
            pkg("b", &["d"]),
            pkg("c", &["d"]),
            pkg("d", &[]),
        ])
        .expect("valid graph")
    }

    #[test]
    fn leaf_is_ready_immediately() {
        let graph = diamond();
        let state = ExecutionState::with_all_pending(graph.build_order().iter().cloned());
        assert!(is_ready(&graph, &state, "d"));
        assert!(!is_ready(&graph, &state, "b"));
    }

    #[test]
    fn completed_dependency_satisfies_readiness() {
        let graph = diamond();
        let mut state = ExecutionState::with_all_pending(graph.build_order().iter().cloned());
        state.pending.remove("d");
        state.completed.insert("d".to_string());

        assert!(is_ready(&graph, &state, "b"));
        assert!(is_ready(&graph, &state, "c"));
        assert!(!is_ready(&graph, &state, "a"));
    }

    #[test]
    fn skipped_no_changes_satisfies_but_plain_skip_does_not() {
        let graph = diamond();
        let mut state = ExecutionState::with_all_pending(graph.build_order().iter().cloned());
        state.pending.remove("d");
        state
            .skipped_no_changes
            .insert("d".to_string(), "no-changes".to_string());
        assert!(is_ready(&graph, &state, "b"));

        let mut state = ExecutionState::with_all_pending(graph.build_order().iter().cloned());
        state.pending.remove("d");
        state
            .skipped
            .insert("d".to_string(), "depends on failed x".to_string());
        assert!(!is_ready(&graph, &state, "b"));
    }

    #[test]
    fn failed_dependency_blocks_readiness() {
        let graph = diamond();
        let mut state = ExecutionState::with_all_pending(graph.build_order().iter().cloned());
        state.pending.remove("d");
        state.failed.insert(
            "d".to_string(),
            crate::state::FailedPackage::for_tests("d", "boom"),
        );
        assert!(!is_ready(&graph, &state, "b"));
    }

    #[test]
    fn unknown_package_is_never_ready() {
        let graph = diamond();
        let state = ExecutionState::with_all_pending(graph.build_order().iter().cloned());
        assert!(!is_ready(&graph, &state, "ghost"));
    }

    #[test]
    fn dependent_count_counts_direct_edges_only() {
        let graph = diamond();
        assert_eq!(dependent_count(&graph, "d"), 2);
        assert_eq!(dependent_count(&graph, "b"), 1);
        assert_eq!(dependent_count(&graph, "a"), 0);
        assert_eq!(dependent_count(&graph, "ghost"), 0);
    }

    #[test]
    fn depth_is_longest_path_to_leaf() {
        let graph = diamond();
        assert_eq!(depth(&graph, "d"), 0);
        assert_eq!(depth(&graph, "b"), 1);
        assert_eq!(depth(&graph, "c"), 1);
        assert_eq!(depth(&graph, "a"), 2);
    }

    #[test]
    fn depth_terminates_on_a_cycle() {
        let packages: BTreeMap<String, PackageInfo> = [
            ("a".to_string(), pkg("a", &["b"])),
            ("b".to_string(), pkg("b", &["a"])),
        ]
        .into_iter()
        .collect();
        let edges: BTreeMap<String, std::collections::BTreeSet<String>> = [
            ("a".to_string(), ["b".to_string()].into_iter().collect()),
            ("b".to_string(), ["a".to_string()].into_iter().collect()),
        ]
        .into_iter()
        .collect();
        let reverse = edges.clone();
        let graph = PackageGraph::from_parts_unchecked(packages, edges, reverse);

        // Must not loop; cycle members report 0.
        assert_eq!(depth(&graph, "a"), 0);
        assert_eq!(depth(&graph, "b"), 0);
    }
}
