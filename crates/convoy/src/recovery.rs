//! Offline mutations of a persisted checkpoint: the manual-recovery
//! operations an operator reaches for when a run needs help.
//!
//! The manager never executes packages. Every operation mutates the
//! in-memory checkpoint, re-derives readiness, persists, and logs what it
//! did.

use std::collections::BTreeSet;
use std::ffi::OsStr;

use anyhow::{Result, bail};
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::classify::ErrorKind;
use crate::events::Reporter;
use crate::graph::PackageGraph;
use crate::state::FailedPackage;
use crate::types::RecoveryHint;

/// Age beyond which a running entry is reported as suspicious.
const STUCK_RUNNING_HOURS: i64 = 1;

/// Result of a structural check over the checkpoint state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateValidation {
    pub valid: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
}

/// Operator-driven mutations over a loaded checkpoint.
pub struct RecoveryManager<'a> {
    checkpoint: Checkpoint,
    graph: &'a PackageGraph,
    store: &'a CheckpointStore,
}

impl<'a> RecoveryManager<'a> {
    pub fn new(checkpoint: Checkpoint, graph: &'a PackageGraph, store: &'a CheckpointStore) -> Self {
        Self {
            checkpoint,
            graph,
            store,
        }
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub fn into_checkpoint(self) -> Checkpoint {
        self.checkpoint
    }

    /// Force packages into the completed bucket. Each id resolves by exact
    /// name first, then by the basename of a package path. Marking a
    /// package completed is how an operator unblocks a cascade after
    /// fixing its root cause out of band.
    pub fn mark_completed(&mut self, ids: &[String], reporter: &mut dyn Reporter) -> Result<()> {
        for id in ids {
            let name = self.resolve_id(id)?;
            if self.checkpoint.state.completed.contains(&name) {
                reporter.warn(&format!("{name} is already completed"));
                continue;
            }
            self.checkpoint.state.remove_everywhere(&name);
            self.checkpoint.state.completed.insert(name.clone());
            reporter.info(&format!("{name}: marked completed"));
        }
        self.commit("mark-completed", reporter)
    }

    /// Force packages into the failed bucket with an operator-supplied
    /// reason, cascading to every transitive dependent.
    pub fn mark_failed(
        &mut self,
        names: &[String],
        reason: &str,
        reporter: &mut dyn Reporter,
    ) -> Result<()> {
        for raw in names {
            let name = self.known_package(raw)?;

            let dependencies: Vec<String> = self
                .graph
                .dependencies_of(&name)
                .map(|deps| deps.iter().cloned().collect())
                .unwrap_or_default();
            let dependents = self.graph.transitive_dependents(&name);

            self.checkpoint.state.remove_everywhere(&name);
            self.checkpoint.state.failed.insert(
                name.clone(),
                FailedPackage {
                    name: name.clone(),
                    message: reason.to_string(),
                    detail: None,
                    classification: ErrorKind::Unknown,
                    retriable: false,
                    attempt: 1,
                    failed_at: Utc::now(),
                    dependencies,
                    dependents: dependents.iter().cloned().collect(),
                },
            );
            reporter.info(&format!("{name}: marked failed ({reason})"));

            for dependent in dependents {
                if self.checkpoint.state.skipped.contains_key(&dependent) {
                    continue;
                }
                self.checkpoint.state.remove_everywhere(&dependent);
                self.checkpoint
                    .state
                    .skipped
                    .insert(dependent, format!("depends on failed {name}"));
            }
        }
        self.commit("mark-failed", reporter)
    }

    /// Skip packages and everything that transitively depends on them.
    pub fn skip_packages(&mut self, names: &[String], reporter: &mut dyn Reporter) -> Result<()> {
        let mut closure: BTreeSet<String> = BTreeSet::new();
        for raw in names {
            let name = self.known_package(raw)?;
            closure.extend(self.graph.transitive_dependents(&name));
            closure.insert(name);
        }

        for name in closure {
            if self.checkpoint.state.skipped.contains_key(&name) {
                continue;
            }
            self.checkpoint.state.remove_everywhere(&name);
            self.checkpoint
                .state
                .skipped
                .insert(name.clone(), "skipped by recovery".to_string());
            reporter.info(&format!("{name}: skipped"));
        }
        self.commit("skip-packages", reporter)
    }

    /// Move failed packages back to pending so a resumed run retries them.
    ///
    /// Without `max_retries`, only failures classified as retriable are
    /// selected. Supplying `max_retries` forces every failure back into
    /// rotation and zeroes its attempt counter. Skipped dependents of each
    /// retried package are unblocked too.
    pub fn retry_failed(
        &mut self,
        max_retries: Option<u32>,
        reporter: &mut dyn Reporter,
    ) -> Result<usize> {
        let selected: Vec<String> = self
            .checkpoint
            .state
            .failed
            .iter()
            .filter(|(_, failed)| max_retries.is_some() || failed.retriable)
            .map(|(name, _)| name.clone())
            .collect();

        for name in &selected {
            if max_retries.is_some() {
                self.checkpoint.retry_attempts.insert(name.clone(), 0);
            }
            self.checkpoint.state.failed.remove(name);
            self.checkpoint.state.pending.insert(name.clone());
            reporter.info(&format!("{name}: queued for retry"));

            for dependent in self.graph.transitive_dependents(name) {
                if self.checkpoint.state.skipped.remove(&dependent).is_some() {
                    self.checkpoint.state.pending.insert(dependent);
                }
            }
        }

        self.commit("retry-failed", reporter)?;
        Ok(selected.len())
    }

    /// Convert every failure into a skip, clearing the failed bucket.
    pub fn skip_failed(&mut self, reporter: &mut dyn Reporter) -> Result<usize> {
        let failed: Vec<String> = self.checkpoint.state.failed.keys().cloned().collect();
        let count = failed.len();
        if count > 0 {
            self.skip_packages(&failed, reporter)?;
        }
        Ok(count)
    }

    /// Return a package to pristine pending state: no bucket membership,
    /// no retry counter, no recorded timings.
    pub fn reset_package(&mut self, name: &str, reporter: &mut dyn Reporter) -> Result<()> {
        let name = self.known_package(name)?;

        self.checkpoint.state.remove_everywhere(&name);
        self.checkpoint.retry_attempts.remove(&name);
        self.checkpoint.start_times.remove(&name);
        self.checkpoint.end_times.remove(&name);
        self.checkpoint.durations_ms.remove(&name);
        self.checkpoint.state.pending.insert(name.clone());

        reporter.info(&format!("{name}: reset to pending"));
        self.commit("reset-package", reporter)
    }

    /// Shared readiness re-derivation: unblock skipped packages whose
    /// dependencies are now satisfied, then promote ready pending ones.
    pub fn update_ready_state(&mut self) {
        self.checkpoint.state.unblock_skipped(self.graph);
        self.checkpoint.state.refresh_ready(self.graph);
    }

    /// Structural check over the state: bucket duplicates and missing
    /// packages are hard issues; suspicious-but-legal situations are
    /// warnings.
    pub fn validate_state(&self) -> StateValidation {
        let mut issues = Vec::new();
        let mut warnings = Vec::new();
        let state = &self.checkpoint.state;

        for name in &self.checkpoint.build_order {
            match state.occurrences(name) {
                0 => issues.push(format!("{name} is missing from every bucket")),
                1 => {}
                n => issues.push(format!("{name} appears in {n} buckets")),
            }
        }

        for name in &state.completed {
            let Some(deps) = self.graph.dependencies_of(name) else {
                continue;
            };
            for dep in deps {
                if !state.completed.contains(dep) && !state.skipped_no_changes.contains_key(dep) {
                    warnings.push(format!(
                        "{name} is completed but its dependency {dep} is not"
                    ));
                }
            }
        }

        let stuck_after = ChronoDuration::hours(STUCK_RUNNING_HOURS);
        for (name, started_at) in &state.running {
            if Utc::now() - *started_at > stuck_after {
                warnings.push(format!(
                    "{name} has been running since {started_at}, over an hour ago"
                ));
            }
        }

        StateValidation {
            valid: issues.is_empty(),
            issues,
            warnings,
        }
    }

    /// Advisory hints about how to get the run unstuck. Purely
    /// informational.
    pub fn generate_recovery_hints(&self) -> Vec<RecoveryHint> {
        let mut hints = Vec::new();
        let state = &self.checkpoint.state;

        let retriable = state.failed.values().filter(|f| f.retriable).count();
        if retriable > 0 {
            hints.push(RecoveryHint {
                kind: "retriable-failures".to_string(),
                message: format!("{retriable} failures look transient"),
                actionable: true,
                suggested_command: Some("retry-failed".to_string()),
            });
        }

        let permanent = state.failed.len() - retriable;
        if permanent > 0 {
            hints.push(RecoveryHint {
                kind: "permanent-failures".to_string(),
                message: format!(
                    "{permanent} failures need a fix before they can succeed"
                ),
                actionable: true,
                suggested_command: Some(
                    "skip-failed, or fix the cause and retry-failed with a retry budget"
                        .to_string(),
                ),
            });
        }

        let stuck_after = ChronoDuration::hours(STUCK_RUNNING_HOURS);
        let stuck: Vec<&str> = state
            .running
            .iter()
            .filter(|(_, started_at)| Utc::now() - **started_at > stuck_after)
            .map(|(name, _)| name.as_str())
            .collect();
        if !stuck.is_empty() {
            hints.push(RecoveryHint {
                kind: "long-running".to_string(),
                message: format!(
                    "still marked running after more than an hour: {}",
                    stuck.join(", ")
                ),
                actionable: false,
                suggested_command: None,
            });
        }

        hints
    }

    fn commit(&mut self, operation: &str, reporter: &mut dyn Reporter) -> Result<()> {
        self.update_ready_state();
        self.checkpoint.recovery_hints = self.generate_recovery_hints();
        self.store.save(&mut self.checkpoint)?;
        reporter.info(&format!("recovery operation {operation} persisted"));
        Ok(())
    }

    /// Exact package name, or an error naming what exists.
    fn known_package(&self, name: &str) -> Result<String> {
        if self.checkpoint.graph_snapshot.contains_key(name) {
            return Ok(name.to_string());
        }
        bail!(
            "unknown package {name}; available: {}",
            self.available_names()
        );
    }

    /// Exact name match, falling back to the basename of a package path.
    fn resolve_id(&self, id: &str) -> Result<String> {
        if self.checkpoint.graph_snapshot.contains_key(id) {
            return Ok(id.to_string());
        }
        for (name, info) in &self.checkpoint.graph_snapshot {
            if info.path.file_name() == Some(OsStr::new(id)) {
                return Ok(name.clone());
            }
        }
        bail!(
            "unknown package {id}; available: {}",
            self.available_names()
        );
    }

    fn available_names(&self) -> String {
        self.checkpoint
            .graph_snapshot
            .keys()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::tempdir;

    use crate::events::NullReporter;
    use crate::exec::ExecutionError;
    use crate::state::Bucket;
    use crate::testutil::{
        ScriptedExecutor, VecReporter, graph_from, pool_for, test_options,
    };
    use crate::types::{PackageInfo, PoolOptions};

    use super::*;

    fn diamond() -> PackageGraph {
        graph_from(&[
            ("a", &["b", "c"]),
            ("b", &["d"]),
            ("c", &["d"]),
            ("d", &[]),
        ])
    }

    /// Run the diamond with d failing permanently, leaving the failure
    /// cascade in the persisted checkpoint.
    fn failed_diamond_checkpoint(dir: &std::path::Path) -> (PackageGraph, Checkpoint) {
        let graph = diamond();
        let executor = Arc::new(
            ScriptedExecutor::new().failing("d", ExecutionError::new("error: could not compile `d`")),
        );
        let mut pool = pool_for(&graph, executor, test_options(dir));
        let result = pool.execute(&mut NullReporter).expect("execute");
        assert!(!result.success);

        let store = CheckpointStore::new(dir);
        let checkpoint = store.load().expect("load").expect("present").checkpoint;
        (graph, checkpoint)
    }

    #[test]
    fn mark_completed_unblocks_direct_dependents_only() {
        let td = tempdir().expect("tempdir");
        let (graph, checkpoint) = failed_diamond_checkpoint(td.path());
        let store = CheckpointStore::new(td.path());

        let mut manager = RecoveryManager::new(checkpoint, &graph, &store);
        manager
            .mark_completed(&["d".to_string()], &mut NullReporter)
            .expect("mark completed");

        let state = &manager.checkpoint().state;
        assert!(state.completed.contains("d"));
        assert_eq!(state.bucket_of("b"), Some(Bucket::Ready));
        assert_eq!(state.bucket_of("c"), Some(Bucket::Ready));
        // a still waits on b and c, so it stays skipped.
        assert_eq!(state.bucket_of("a"), Some(Bucket::Skipped));
        assert!(state.failed.is_empty() || !state.failed.contains_key("d"));
    }

    #[test]
    fn resumed_run_finishes_after_mark_completed() {
        let td = tempdir().expect("tempdir");
        let (graph, checkpoint) = failed_diamond_checkpoint(td.path());
        let store = CheckpointStore::new(td.path());

        let mut manager = RecoveryManager::new(checkpoint, &graph, &store);
        manager
            .mark_completed(&["d".to_string()], &mut NullReporter)
            .expect("mark completed");

        let executor = Arc::new(ScriptedExecutor::new());
        let mut options = test_options(td.path());
        options.continue_from_checkpoint = true;
        let mut pool = pool_for(&graph, executor, options);
        let result = pool.execute(&mut NullReporter).expect("execute");

        assert!(result.success);
        assert_eq!(result.completed, ["a", "b", "c", "d"]);
    }

    #[test]
    fn mark_completed_resolves_path_basenames() {
        let td = tempdir().expect("tempdir");
        let graph = PackageGraph::new(vec![PackageInfo::new(
            "@acme/widgets",
            "1.0.0",
            "/w/widgets-dir",
            Vec::new(),
        )])
        .expect("valid graph");
        let store = CheckpointStore::new(td.path());
        let options = PoolOptions::new("build", 1, td.path());
        let checkpoint = Checkpoint::new(&graph, &options, "exec-1");

        let mut manager = RecoveryManager::new(checkpoint, &graph, &store);
        manager
            .mark_completed(&["widgets-dir".to_string()], &mut NullReporter)
            .expect("mark completed");

        assert!(manager.checkpoint().state.completed.contains("@acme/widgets"));
    }

    #[test]
    fn mark_completed_rejects_unknown_ids_listing_packages() {
        let td = tempdir().expect("tempdir");
        let (graph, checkpoint) = failed_diamond_checkpoint(td.path());
        let store = CheckpointStore::new(td.path());

        let mut manager = RecoveryManager::new(checkpoint, &graph, &store);
        let err = manager
            .mark_completed(&["ghost".to_string()], &mut NullReporter)
            .expect_err("must fail");
        let msg = err.to_string();
        assert!(msg.contains("unknown package ghost"));
        assert!(msg.contains("a, b, c, d"));
    }

    #[test]
    fn mark_completed_warns_on_already_completed() {
        let td = tempdir().expect("tempdir");
        let (graph, mut checkpoint) = failed_diamond_checkpoint(td.path());
        checkpoint.state.remove_everywhere("d");
        checkpoint.state.completed.insert("d".to_string());
        let store = CheckpointStore::new(td.path());

        let mut reporter = VecReporter::default();
        let mut manager = RecoveryManager::new(checkpoint, &graph, &store);
        manager
            .mark_completed(&["d".to_string()], &mut reporter)
            .expect("no-op");

        assert!(reporter.warns.iter().any(|w| w.contains("already completed")));
        assert!(manager.checkpoint().state.completed.contains("d"));
    }

    #[test]
    fn mark_failed_records_reason_and_cascades() {
        let td = tempdir().expect("tempdir");
        let graph = diamond();
        let store = CheckpointStore::new(td.path());
        let options = PoolOptions::new("build", 2, td.path());
        let checkpoint = Checkpoint::new(&graph, &options, "exec-1");

        let mut manager = RecoveryManager::new(checkpoint, &graph, &store);
        manager
            .mark_failed(&["d".to_string()], "bad artefact", &mut NullReporter)
            .expect("mark failed");

        let state = &manager.checkpoint().state;
        let failed = state.failed.get("d").expect("failed entry");
        assert_eq!(failed.message, "bad artefact");
        assert!(!failed.retriable);
        assert_eq!(failed.attempt, 1);

        for name in ["a", "b", "c"] {
            assert_eq!(state.bucket_of(name), Some(Bucket::Skipped), "{name}");
        }
    }

    #[test]
    fn skip_packages_takes_the_transitive_closure() {
        let td = tempdir().expect("tempdir");
        let graph = diamond();
        let store = CheckpointStore::new(td.path());
        let options = PoolOptions::new("build", 2, td.path());
        let checkpoint = Checkpoint::new(&graph, &options, "exec-1");

        let mut manager = RecoveryManager::new(checkpoint, &graph, &store);
        manager
            .skip_packages(&["b".to_string()], &mut NullReporter)
            .expect("skip");

        let state = &manager.checkpoint().state;
        assert_eq!(state.bucket_of("b"), Some(Bucket::Skipped));
        assert_eq!(state.bucket_of("a"), Some(Bucket::Skipped));
        // c and d are untouched.
        assert_eq!(state.bucket_of("d"), Some(Bucket::Ready));
        assert_eq!(state.bucket_of("c"), Some(Bucket::Pending));
    }

    #[test]
    fn retry_failed_selects_only_retriable_without_force() {
        let td = tempdir().expect("tempdir");
        let graph = graph_from(&[("a", &[]), ("b", &[])]);
        let store = CheckpointStore::new(td.path());
        let options = PoolOptions::new("build", 2, td.path());
        let mut checkpoint = Checkpoint::new(&graph, &options, "exec-1");

        checkpoint.state.pending.clear();
        let mut transient = FailedPackage::for_tests("a", "connection reset");
        transient.retriable = true;
        checkpoint.state.failed.insert("a".to_string(), transient);
        checkpoint
            .state
            .failed
            .insert("b".to_string(), FailedPackage::for_tests("b", "tests failed"));
        checkpoint.retry_attempts.insert("a".to_string(), 3);

        let mut manager = RecoveryManager::new(checkpoint, &graph, &store);
        let count = manager
            .retry_failed(None, &mut NullReporter)
            .expect("retry");

        assert_eq!(count, 1);
        let state = &manager.checkpoint().state;
        assert_eq!(state.bucket_of("a"), Some(Bucket::Ready));
        assert_eq!(state.bucket_of("b"), Some(Bucket::Failed));
        // No force: the attempt counter is untouched.
        assert_eq!(manager.checkpoint().retry_attempts.get("a"), Some(&3));
    }

    #[test]
    fn retry_failed_with_budget_forces_everything_and_resets_counters() {
        let td = tempdir().expect("tempdir");
        let (graph, checkpoint) = failed_diamond_checkpoint(td.path());
        let store = CheckpointStore::new(td.path());

        let mut manager = RecoveryManager::new(checkpoint, &graph, &store);
        let count = manager
            .retry_failed(Some(3), &mut NullReporter)
            .expect("retry");

        assert_eq!(count, 1);
        let checkpoint = manager.checkpoint();
        assert_eq!(checkpoint.retry_attempts.get("d"), Some(&0));
        // d is back in rotation and its skipped dependents are unblocked.
        assert_eq!(checkpoint.state.bucket_of("d"), Some(Bucket::Ready));
        for name in ["a", "b", "c"] {
            assert_eq!(
                checkpoint.state.bucket_of(name),
                Some(Bucket::Pending),
                "{name}"
            );
        }
    }

    #[test]
    fn skip_failed_clears_the_failed_bucket() {
        let td = tempdir().expect("tempdir");
        let (graph, checkpoint) = failed_diamond_checkpoint(td.path());
        let store = CheckpointStore::new(td.path());

        let mut manager = RecoveryManager::new(checkpoint, &graph, &store);
        let count = manager.skip_failed(&mut NullReporter).expect("skip failed");

        assert_eq!(count, 1);
        let state = &manager.checkpoint().state;
        assert!(state.failed.is_empty());
        assert_eq!(state.bucket_of("d"), Some(Bucket::Skipped));
    }

    #[test]
    fn reset_package_clears_counters_and_timings() {
        let td = tempdir().expect("tempdir");
        let (graph, checkpoint) = failed_diamond_checkpoint(td.path());
        let store = CheckpointStore::new(td.path());

        let mut manager = RecoveryManager::new(checkpoint, &graph, &store);
        manager
            .reset_package("d", &mut NullReporter)
            .expect("reset");

        let checkpoint = manager.checkpoint();
        assert_eq!(checkpoint.retry_attempts.get("d"), None);
        assert!(!checkpoint.start_times.contains_key("d"));
        assert!(!checkpoint.end_times.contains_key("d"));
        assert!(!checkpoint.durations_ms.contains_key("d"));
        // Pending with no dependencies means it is promoted to ready.
        assert_eq!(checkpoint.state.bucket_of("d"), Some(Bucket::Ready));
    }

    #[test]
    fn validate_state_flags_duplicates_and_missing() {
        let td = tempdir().expect("tempdir");
        let graph = diamond();
        let store = CheckpointStore::new(td.path());
        let options = PoolOptions::new("build", 2, td.path());
        let mut checkpoint = Checkpoint::new(&graph, &options, "exec-1");

        checkpoint.state.ready.push("d".to_string()); // duplicate with pending
        checkpoint.state.pending.remove("a"); // missing

        let manager = RecoveryManager::new(checkpoint, &graph, &store);
        let validation = manager.validate_state();

        assert!(!validation.valid);
        assert!(validation.issues.iter().any(|i| i.contains("d appears in 2 buckets")));
        assert!(validation.issues.iter().any(|i| i.contains("a is missing")));
    }

    #[test]
    fn validate_state_warns_on_completed_with_unmet_deps_and_stuck_running() {
        let td = tempdir().expect("tempdir");
        let graph = diamond();
        let store = CheckpointStore::new(td.path());
        let options = PoolOptions::new("build", 2, td.path());
        let mut checkpoint = Checkpoint::new(&graph, &options, "exec-1");

        checkpoint.state.pending.remove("b");
        checkpoint.state.completed.insert("b".to_string()); // d is not completed
        checkpoint.state.pending.remove("c");
        checkpoint
            .state
            .running
            .insert("c".to_string(), Utc::now() - ChronoDuration::hours(2));

        let manager = RecoveryManager::new(checkpoint, &graph, &store);
        let validation = manager.validate_state();

        assert!(validation.valid);
        assert!(
            validation
                .warnings
                .iter()
                .any(|w| w.contains("b is completed but its dependency d"))
        );
        assert!(validation.warnings.iter().any(|w| w.contains("c has been running")));
    }

    #[test]
    fn hints_summarise_failures_and_stuck_packages() {
        let td = tempdir().expect("tempdir");
        let graph = graph_from(&[("a", &[]), ("b", &[]), ("c", &[])]);
        let store = CheckpointStore::new(td.path());
        let options = PoolOptions::new("build", 2, td.path());
        let mut checkpoint = Checkpoint::new(&graph, &options, "exec-1");

        checkpoint.state.pending.clear();
        let mut transient = FailedPackage::for_tests("a", "timeout");
        transient.retriable = true;
        checkpoint.state.failed.insert("a".to_string(), transient);
        checkpoint
            .state
            .failed
            .insert("b".to_string(), FailedPackage::for_tests("b", "tests failed"));
        checkpoint
            .state
            .running
            .insert("c".to_string(), Utc::now() - ChronoDuration::hours(3));

        let manager = RecoveryManager::new(checkpoint, &graph, &store);
        let hints = manager.generate_recovery_hints();

        assert_eq!(hints.len(), 3);
        assert!(hints.iter().any(|h| h.kind == "retriable-failures" && h.actionable));
        assert!(hints.iter().any(|h| h.kind == "permanent-failures"));
        assert!(hints.iter().any(|h| h.kind == "long-running" && !h.actionable));
    }
}
