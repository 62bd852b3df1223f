//! Priority scheduling over the ready queue.
//!
//! Packages that unblock the most downstream work go first, shorter
//! critical paths next, and retried packages are pushed back so a flaky
//! item cannot starve fresh work. A small bonus lets leaf packages (no
//! dependents) finish early and produce visible results.

use std::collections::BTreeMap;

use crate::deps;
use crate::graph::PackageGraph;
use crate::state::ExecutionState;

/// Priority score for one ready package. Higher runs sooner.
pub fn priority_score(
    graph: &PackageGraph,
    name: &str,
    retry_attempts: &BTreeMap<String, u32>,
) -> i64 {
    let dependents = deps::dependent_count(graph, name) as i64;
    let depth = deps::depth(graph, name) as i64;
    let retries = retry_attempts.get(name).copied().unwrap_or(0) as i64;
    let leaf_bonus = if dependents == 0 { 5 } else { 0 };

    100 * dependents - 10 * depth - 50 * retries + leaf_bonus
}

/// Up to `free_slots` packages from the ready queue, highest score first.
/// Ties keep the queue's submission order. Empty when there are no free
/// slots or nothing is ready.
pub fn next_batch(
    graph: &PackageGraph,
    state: &ExecutionState,
    retry_attempts: &BTreeMap<String, u32>,
    free_slots: usize,
) -> Vec<String> {
    if free_slots == 0 || state.ready.is_empty() {
        return Vec::new();
    }

    let mut ranked: Vec<&String> = state.ready.iter().collect();
    // Stable sort: equal scores stay in submission order.
    ranked.sort_by_key(|name| std::cmp::Reverse(priority_score(graph, name, retry_attempts)));

    ranked
        .into_iter()
        .take(free_slots)
        .cloned()
        .collect()
}
