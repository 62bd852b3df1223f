//! The execution state: seven disjoint buckets partitioning every package
//! in the graph, plus the transitions shared by the pool and the recovery
//! manager.
//!
//! Invariant: at every externally observable moment, each package appears
//! in exactly one bucket. The checkpoint store refuses to persist a state
//! that violates this.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classify::ErrorKind;
use crate::deps;
use crate::graph::PackageGraph;

/// Persisted record of a permanent failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedPackage {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub classification: ErrorKind,
    pub retriable: bool,
    /// Attempt number at which the failure became terminal.
    pub attempt: u32,
    pub failed_at: DateTime<Utc>,
    /// Direct dependencies at failure time.
    pub dependencies: Vec<String>,
    /// Transitive dependents at failure time (names only, no structures).
    pub dependents: Vec<String>,
}

impl FailedPackage {
    #[cfg(test)]
    pub(crate) fn for_tests(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            message: message.to_string(),
            detail: None,
            classification: ErrorKind::Unknown,
            retriable: false,
            attempt: 1,
            failed_at: Utc::now(),
            dependencies: Vec::new(),
            dependents: Vec::new(),
        }
    }
}

/// Which bucket a package currently sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
    SkippedNoChanges,
}

impl Bucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Pending => "pending",
            Bucket::Ready => "ready",
            Bucket::Running => "running",
            Bucket::Completed => "completed",
            Bucket::Failed => "failed",
            Bucket::Skipped => "skipped",
            Bucket::SkippedNoChanges => "skipped-no-changes",
        }
    }
}

/// The seven buckets. `ready` keeps submission order so the scheduler's
/// tie-break is stable; everything else is name-ordered for deterministic
/// serialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub pending: BTreeSet<String>,
    pub ready: Vec<String>,
    /// Running packages with their dispatch time. Cancellation handles are
    /// held by the pool only and are never persisted.
    pub running: BTreeMap<String, DateTime<Utc>>,
    pub completed: BTreeSet<String>,
    pub failed: BTreeMap<String, FailedPackage>,
    /// Skipped because a dependency failed, or by manual recovery.
    pub skipped: BTreeMap<String, String>,
    /// Self-reported "nothing to do"; satisfies downstream readiness.
    pub skipped_no_changes: BTreeMap<String, String>,
}

impl ExecutionState {
    /// Fresh state with every package pending.
    pub fn with_all_pending(names: impl IntoIterator<Item = String>) -> Self {
        Self {
            pending: names.into_iter().collect(),
            ..Self::default()
        }
    }

    /// The bucket currently holding `name`, if any. When the partition
    /// invariant holds there is exactly one.
    pub fn bucket_of(&self, name: &str) -> Option<Bucket> {
        if self.pending.contains(name) {
            Some(Bucket::Pending)
        } else if self.ready.iter().any(|n| n == name) {
            Some(Bucket::Ready)
        } else if self.running.contains_key(name) {
            Some(Bucket::Running)
        } else if self.completed.contains(name) {
            Some(Bucket::Completed)
        } else if self.failed.contains_key(name) {
            Some(Bucket::Failed)
        } else if self.skipped.contains_key(name) {
            Some(Bucket::Skipped)
        } else if self.skipped_no_changes.contains_key(name) {
            Some(Bucket::SkippedNoChanges)
        } else {
            None
        }
    }

    /// How many buckets contain `name`. Anything other than 1 is a
    /// partition violation.
    pub fn occurrences(&self, name: &str) -> usize {
        usize::from(self.pending.contains(name))
            + self.ready.iter().filter(|n| n.as_str() == name).count()
            + usize::from(self.running.contains_key(name))
            + usize::from(self.completed.contains(name))
            + usize::from(self.failed.contains_key(name))
            + usize::from(self.skipped.contains_key(name))
            + usize::from(self.skipped_no_changes.contains_key(name))
    }

    /// Union of all buckets.
    pub fn all_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        names.extend(self.pending.iter().cloned());
        names.extend(self.ready.iter().cloned());
        names.extend(self.running.keys().cloned());
        names.extend(self.completed.iter().cloned());
        names.extend(self.failed.keys().cloned());
        names.extend(self.skipped.keys().cloned());
        names.extend(self.skipped_no_changes.keys().cloned());
        names
    }

    /// Remove `name` from every bucket it appears in.
    pub fn remove_everywhere(&mut self, name: &str) {
        self.pending.remove(name);
        self.ready.retain(|n| n != name);
        self.running.remove(name);
        self.completed.remove(name);
        self.failed.remove(name);
        self.skipped.remove(name);
        self.skipped_no_changes.remove(name);
    }

    /// Terminal condition for the main loop: nothing left to dispatch or
    /// wait on.
    pub fn is_finished(&self) -> bool {
        self.pending.is_empty() && self.ready.is_empty() && self.running.is_empty()
    }

    /// Violations of the partition invariant against the expected package
    /// set: duplicates, packages in no bucket, and names no graph knows.
    pub fn partition_violations(&self, expected: &BTreeSet<String>) -> Vec<String> {
        let mut issues = Vec::new();

        for name in expected {
            match self.occurrences(name) {
                0 => issues.push(format!("package {name} is in no bucket")),
                1 => {}
                n => issues.push(format!("package {name} appears in {n} buckets")),
            }
        }

        for name in self.all_names() {
            if !expected.contains(&name) {
                issues.push(format!("state names unknown package {name}"));
            }
        }

        issues
    }

    /// Move every pending package whose dependencies are satisfied into the
    /// ready queue, in build order so scheduling tie-breaks stay stable.
    pub fn refresh_ready(&mut self, graph: &PackageGraph) {
        for name in graph.build_order() {
            if self.pending.contains(name) && deps::is_ready(graph, self, name) {
                self.pending.remove(name);
                self.ready.push(name.clone());
            }
        }
    }

    /// Re-evaluate skipped packages: any whose dependencies are now all
    /// satisfied (and none failed) moves back to pending. This is how
    /// marking a failed dependency completed unblocks its cascade.
    pub fn unblock_skipped(&mut self, graph: &PackageGraph) {
        let unblocked: Vec<String> = self
            .skipped
            .keys()
            .filter(|name| deps::is_ready(graph, self, name))
            .cloned()
            .collect();

        for name in unblocked {
            self.skipped.remove(&name);
            self.pending.insert(name);
        }
    }
}
