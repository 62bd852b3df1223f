//! Repository identity resolution for the convoy execution engine.
//!
//! Every package in a run carries its own repository identity, read from the
//! git repository rooted at the package's directory. Resolving the remote
//! from the package path (instead of the process working directory) is what
//! keeps identities from bleeding between packages when many of them execute
//! concurrently.
//!
//! # Example
//!
//! ```
//! use convoy_git::RepoIdentity;
//!
//! let id = RepoIdentity::parse("git@github.com:acme/widgets.git").unwrap();
//! assert_eq!(id.host, "github.com");
//! assert_eq!(id.owner, "acme");
//! assert_eq!(id.name, "widgets");
//! assert_eq!(id.canonical_url(), "https://github.com/acme/widgets");
//! ```

use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Repository identity extracted from a git remote URL.
///
/// Understands the common remote shapes — scp-like (`git@host:owner/name`),
/// `https://`, and `ssh://` — by reducing them all to the
/// `<host>[:/]<owner>/<name>[.git]` pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoIdentity {
    /// Hostname of the remote, e.g. `github.com`.
    pub host: String,
    /// Owner (or owner path, for hosts with nested groups).
    pub owner: String,
    /// Repository name with any `.git` suffix removed.
    pub name: String,
}

impl RepoIdentity {
    /// Parse a remote URL into its identity parts.
    ///
    /// Fails when the URL does not contain a host plus at least two path
    /// segments; a package whose remote cannot be parsed cannot run.
    pub fn parse(url: &str) -> Result<Self> {
        let trimmed = url.trim();
        if trimmed.is_empty() {
            bail!("remote URL is empty");
        }

        // Drop an explicit scheme (https://, ssh://, git://).
        let rest = match trimmed.split_once("://") {
            Some((_, rest)) => rest,
            None => trimmed,
        };

        // Drop userinfo (git@host:..., user@host/...).
        let rest = match rest.rsplit_once('@') {
            Some((_, rest)) => rest,
            None => rest,
        };

        // The host ends at the first ':' (scp-like) or '/' (URL path).
        let sep = rest
            .find([':', '/'])
            .with_context(|| format!("remote URL has no path component: {url}"))?;
        let host = &rest[..sep];
        let path = rest[sep + 1..].trim_matches('/');

        if host.is_empty() {
            bail!("remote URL has no host: {url}");
        }

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.len() < 2 {
            bail!("remote URL does not name an owner and repository: {url}");
        }

        let raw_name = segments[segments.len() - 1];
        let name = raw_name.strip_suffix(".git").unwrap_or(raw_name);
        let owner = segments[..segments.len() - 1].join("/");

        if name.is_empty() || owner.is_empty() {
            bail!("remote URL does not name an owner and repository: {url}");
        }

        Ok(Self {
            host: host.to_string(),
            owner,
            name: name.to_string(),
        })
    }

    /// Canonical `https://<host>/<owner>/<name>` form of the identity.
    pub fn canonical_url(&self) -> String {
        format!("https://{}/{}/{}", self.host, self.owner, self.name)
    }
}

/// Read the URL of `remote` from the repository rooted at `path`.
///
/// Runs `git remote get-url` with the working directory pinned to the
/// package path; the result is independent of the caller's own cwd. Returns
/// `None` when the remote is not configured.
pub fn get_remote_url(path: &Path, remote: &str) -> Result<Option<String>> {
    let output = Command::new("git")
        .args(["remote", "get-url", remote])
        .current_dir(path)
        .output()
        .with_context(|| format!("failed to run git remote in {}", path.display()))?;

    if !output.status.success() {
        return Ok(None);
    }

    let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if url.is_empty() {
        return Ok(None);
    }
    Ok(Some(url))
}

/// Check whether `path` is inside a git work tree.
pub fn is_git_repo(path: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(path)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Resolve the identity of the repository containing `path`, reading the
/// given remote. Returns `None` when the remote is absent, an error when the
/// remote exists but cannot be parsed.
pub fn resolve_identity(path: &Path, remote: &str) -> Result<Option<RepoIdentity>> {
    match get_remote_url(path, remote)? {
        Some(url) => {
            let identity = RepoIdentity::parse(&url)
                .with_context(|| format!("unparseable remote {remote} in {}", path.display()))?;
            Ok(Some(identity))
        }
        None => Ok(None),
    }
}
