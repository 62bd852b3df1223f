//! Failure classification: decides whether an execution error is worth
//! retrying, and labels it for the failure record.
//!
//! Classification is a pattern match over the lowercased error message and
//! detail. Non-retriable categories are checked first, so an error that
//! matches both a permanent and a transient pattern stays permanent.

use serde::{Deserialize, Serialize};

/// Category assigned to a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Transient I/O: resets, unreachable hosts, rate limits.
    Network,
    /// Repository-scoped contention (lock files present).
    VcsLock,
    /// Package-manager cache contention or transient missing module during
    /// concurrent installs.
    PackageManagerRace,
    /// Remote API backpressure: abuse detection, secondary rate limits,
    /// service unavailable.
    RemoteApiTransient,
    /// Generic timeout indicator.
    Timeout,
    TestFailure,
    CoverageBelowThreshold,
    BuildError,
    MergeConflict,
    DirtyWorkingTree,
    AuthDenied,
    PermissionDenied,
    /// Anything unrecognised. Not retried.
    #[default]
    Unknown,
}

impl ErrorKind {
    /// Whether the engine may re-queue a failure of this kind.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Network
                | ErrorKind::VcsLock
                | ErrorKind::PackageManagerRace
                | ErrorKind::RemoteApiTransient
                | ErrorKind::Timeout
        )
    }
}

const TEST_FAILURE_PATTERNS: &[&str] = &[
    "test failed",
    "tests failed",
    "test failure",
    "failing tests",
    "assertion failed",
];

const COVERAGE_PATTERNS: &[&str] = &[
    "coverage threshold",
    "coverage below",
    "below coverage",
    "does not meet global threshold",
];

const BUILD_ERROR_PATTERNS: &[&str] = &[
    "could not compile",
    "compilation failed",
    "build failed",
    "syntax error",
    "type error",
    "tsc --noemit",
];

const MERGE_CONFLICT_PATTERNS: &[&str] = &[
    "merge conflict",
    "automatic merge failed",
    "conflict (content)",
    "needs merge",
];

const DIRTY_TREE_PATTERNS: &[&str] = &[
    "uncommitted changes",
    "working tree is dirty",
    "dirty working tree",
    "working directory not clean",
    "please commit your changes",
];

const AUTH_PATTERNS: &[&str] = &[
    "authentication failed",
    "bad credentials",
    "invalid token",
    "401",
    "unauthorized",
    "not authorized",
];

const PERMISSION_PATTERNS: &[&str] = &[
    "permission denied",
    "forbidden",
    "403",
    "eacces",
    "eperm",
];

const VCS_LOCK_PATTERNS: &[&str] = &[
    "index.lock",
    "shallow.lock",
    "another git process seems to be running",
    "unable to create '",
];

const PACKAGE_MANAGER_RACE_PATTERNS: &[&str] = &[
    "eintegrity",
    "enotempty",
    "cannot find module",
    "missing module",
    "cache corruption",
    "tarball data",
];

const REMOTE_API_TRANSIENT_PATTERNS: &[&str] = &[
    "abuse detection",
    "secondary rate limit",
    "service unavailable",
    "please wait a few minutes",
];

const TIMEOUT_PATTERNS: &[&str] = &["timeout", "timed out", "etimedout"];

const NETWORK_PATTERNS: &[&str] = &[
    "econnreset",
    "econnrefused",
    "enotfound",
    "enetunreach",
    "socket hang up",
    "connection reset",
    "connection refused",
    "connection closed",
    "network",
    "rate limit",
    "too many requests",
    "429",
    "502",
    "503",
    "504",
    "temporarily unavailable",
    "dns",
    "tls",
];

/// Classify an execution failure from its message and optional detail
/// (stack trace or captured output tail).
pub fn classify(message: &str, detail: Option<&str>) -> ErrorKind {
    let hay = match detail {
        Some(d) => format!("{}\n{}", message, d).to_lowercase(),
        None => message.to_lowercase(),
    };

    let matches = |patterns: &[&str]| patterns.iter().any(|p| hay.contains(p));

    // Non-retriable first: a permanent signal wins over any transient one
    // in the same output.
    if matches(TEST_FAILURE_PATTERNS) {
        return ErrorKind::TestFailure;
    }
    if matches(COVERAGE_PATTERNS) {
        return ErrorKind::CoverageBelowThreshold;
    }
    if matches(BUILD_ERROR_PATTERNS) {
        return ErrorKind::BuildError;
    }
    if matches(MERGE_CONFLICT_PATTERNS) {
        return ErrorKind::MergeConflict;
    }
    if matches(DIRTY_TREE_PATTERNS) {
        return ErrorKind::DirtyWorkingTree;
    }
    if matches(AUTH_PATTERNS) {
        return ErrorKind::AuthDenied;
    }
    if matches(PERMISSION_PATTERNS) {
        return ErrorKind::PermissionDenied;
    }

    if matches(VCS_LOCK_PATTERNS) {
        return ErrorKind::VcsLock;
    }
    if matches(PACKAGE_MANAGER_RACE_PATTERNS) {
        return ErrorKind::PackageManagerRace;
    }
    if matches(REMOTE_API_TRANSIENT_PATTERNS) {
        return ErrorKind::RemoteApiTransient;
    }
    if matches(TIMEOUT_PATTERNS) {
        return ErrorKind::Timeout;
    }
    if matches(NETWORK_PATTERNS) {
        return ErrorKind::Network;
    }

    ErrorKind::Unknown
}
