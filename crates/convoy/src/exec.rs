//! The executor contract: how the pool hands a package to the command
//! runner, and what comes back.
//!
//! Execution is opaque to the engine. An executor receives an
//! [`ExecutionRequest`] and returns either a [`PackageOutcome`] (success or
//! a legitimate "nothing to do" self-skip) or an [`ExecutionError`]. The
//! engine never inspects executor output itself; executors that still rely
//! on the legacy stdout markers can translate them with
//! [`detect_skip_marker`].

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::classify::ErrorKind;
use crate::context::PackageExecutionContext;
use crate::types::PackageInfo;

/// Legacy stdout token marking a self-skip.
pub const SKIP_MARKER: &str = "KODRDRIV_PUBLISH_SKIPPED";

/// Legacy stdout token carrying the self-skip reason.
pub const SKIP_REASON_MARKER: &str = "KODRDRIV_PUBLISH_SKIP_REASON:";

/// Why a package legitimately had nothing to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    NoChanges,
    AlreadyPublished,
    #[default]
    Other,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NoChanges => "no-changes",
            SkipReason::AlreadyPublished => "already-published",
            SkipReason::Other => "other",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw.trim() {
            "no-changes" => SkipReason::NoChanges,
            "already-published" => SkipReason::AlreadyPublished,
            _ => SkipReason::Other,
        }
    }
}

/// Best-effort cancellation handle carried by every dispatched execution.
/// Requesting cancellation asks the executor to abort; it does not forcibly
/// terminate the work.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything an executor needs for one package execution.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub package: String,
    pub info: PackageInfo,
    pub command: String,
    /// The caller's configuration, passed through opaquely.
    pub config: serde_json::Value,
    pub dry_run: bool,
    /// Position of this package in the run, for progress display.
    pub index: usize,
    pub total: usize,
    pub all_packages: Vec<String>,
    pub is_builtin: bool,
    pub context: PackageExecutionContext,
    pub cancel: CancellationFlag,
}

/// Successful (or self-skipped) execution result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackageOutcome {
    /// The package ran and reported there was nothing to do. Counts as
    /// dependency-satisfying for downstream readiness.
    pub skipped_no_changes: bool,
    pub skip_reason: Option<SkipReason>,
    /// Path to the execution's log file, if the executor captured one.
    pub log_file: Option<PathBuf>,
    /// Version string of a published artefact, if the execution produced one.
    pub published_version: Option<String>,
}

impl PackageOutcome {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped_no_changes: true,
            skip_reason: Some(reason),
            ..Self::default()
        }
    }

    pub fn published(version: impl Into<String>) -> Self {
        Self {
            published_version: Some(version.into()),
            ..Self::default()
        }
    }
}

/// A failed execution, with enough detail for classification and the
/// failure record.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message}")]
pub struct ExecutionError {
    pub message: String,
    /// Stack trace or output tail, when available.
    pub detail: Option<String>,
    /// Classification supplied by the executor; the engine classifies from
    /// the message and detail when absent.
    pub classification: Option<ErrorKind>,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
            classification: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn classified(mut self, kind: ErrorKind) -> Self {
        self.classification = Some(kind);
        self
    }
}

/// The command runner the pool drives. Implementations spawn the actual
/// sub-process in the package directory; they must be safe to call from
/// multiple worker threads at once.
pub trait PackageExecutor: Send + Sync {
    fn execute(&self, request: &ExecutionRequest) -> Result<PackageOutcome, ExecutionError>;
}

/// Scan an executor's captured output stream for the legacy skip markers.
///
/// Returns the skip reason when the output contains [`SKIP_MARKER`];
/// the reason defaults to [`SkipReason::Other`] when the reason marker is
/// absent or unrecognised.
pub fn detect_skip_marker(output: &str) -> Option<SkipReason> {
    if !output.contains(SKIP_MARKER) {
        return None;
    }

    let reason = output
        .lines()
        .find_map(|line| {
            line.find(SKIP_REASON_MARKER)
                .map(|at| &line[at + SKIP_REASON_MARKER.len()..])
        })
        .map(SkipReason::parse)
        .unwrap_or_default();

    Some(reason)
}
