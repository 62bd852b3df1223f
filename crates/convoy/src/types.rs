//! Domain types shared across the engine: package descriptions, run options,
//! results, and the typed errors callers are expected to match on.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use convoy_retry::RetryConfig;

/// A node in the dependency graph. The engine treats a package as an opaque
/// (name, path, dependencies) triple; the version string is carried through
/// untouched for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
    /// Unique package name.
    pub name: String,
    /// Version string, opaque to the engine.
    pub version: String,
    /// Filesystem path of the package directory.
    pub path: PathBuf,
    /// Names of the packages this one declares a dependency on.
    pub dependencies: BTreeSet<String>,
}

impl PackageInfo {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        path: impl Into<PathBuf>,
        dependencies: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            path: path.into(),
            dependencies: dependencies.into_iter().collect(),
        }
    }
}

/// Everything the pool needs to run: the command, concurrency cap, checkpoint
/// location, and retry schedule. `original_config` is persisted verbatim into
/// checkpoints so a resumed run can confirm it matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolOptions {
    /// The command executed in every package.
    pub command: String,
    /// Free-form mode label recorded in checkpoints (e.g. "publish").
    #[serde(default)]
    pub mode: String,
    /// Maximum number of packages executing at once.
    pub max_concurrency: usize,
    /// Resume from an existing checkpoint instead of starting fresh.
    #[serde(default)]
    pub continue_from_checkpoint: bool,
    /// Propagated to executors; the engine itself only records it.
    #[serde(default)]
    pub dry_run: bool,
    /// Whether the command is one of the embedder's built-ins. Passed
    /// through to executors untouched.
    #[serde(default)]
    pub is_builtin: bool,
    /// Directory holding the checkpoint files.
    pub checkpoint_dir: PathBuf,
    /// Backoff schedule for transient failures.
    #[serde(default)]
    pub retry: RetryConfig,
    /// The caller's configuration, persisted opaquely.
    #[serde(default)]
    pub original_config: serde_json::Value,
    /// Git remote name used when resolving package execution contexts.
    #[serde(default = "default_git_remote")]
    pub git_remote: String,
}

fn default_git_remote() -> String {
    "origin".to_string()
}

impl PoolOptions {
    pub fn new(command: impl Into<String>, max_concurrency: usize, checkpoint_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            mode: String::new(),
            max_concurrency,
            continue_from_checkpoint: false,
            dry_run: false,
            is_builtin: false,
            checkpoint_dir: checkpoint_dir.into(),
            retry: RetryConfig::default(),
            original_config: serde_json::Value::Null,
            git_remote: default_git_remote(),
        }
    }
}

/// A published artefact reported by an executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedVersion {
    pub package: String,
    pub version: String,
}

/// Advisory recovery hint attached to a checkpoint. Construction is
/// best-effort; hints never influence engine behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryHint {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub actionable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_command: Option<String>,
}

/// Aggregate concurrency metrics for a finished run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub elapsed_ms: u64,
    pub peak_concurrency: usize,
    pub average_concurrency: f64,
    pub total_allocations: u64,
}

/// Final partition of the run, returned by the pool.
///
/// `success` means no package failed. Skipped packages (dependency-failed)
/// do not fail the run by themselves, but they do keep the checkpoint on
/// disk so the run can be recovered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub total_packages: usize,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    pub skipped_no_changes: Vec<String>,
    pub metrics: ExecutionMetrics,
}

/// Engine failures that callers match on, as opposed to the contextual
/// `anyhow` chains used for I/O plumbing.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Nothing is running or ready but packages remain pending. The graph
    /// invariant should make this impossible; it is detected and surfaced
    /// rather than spun on.
    #[error("execution deadlock: {0} packages remain pending with nothing running or ready")]
    Deadlock(usize),

    /// A package execution context could not be resolved before the run.
    #[error("package {package}: cannot resolve execution context: {reason}")]
    Context { package: String, reason: String },

    /// A persisted checkpoint carries an incompatible schema version.
    #[error("checkpoint schema {found} is not compatible with {expected}")]
    SchemaMismatch { found: String, expected: String },
}
