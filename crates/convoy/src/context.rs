//! Per-package execution context: repository identity resolved from the
//! package's own directory.
//!
//! Contexts are resolved once for every package before anything runs, and
//! are validated again before each dispatch. Resolution reads the git
//! remote from the package path — never from the process working directory,
//! which is meaningless while several packages execute concurrently.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, bail};
use serde::{Deserialize, Serialize};

/// Immutable per-package identity, propagated into the executor's child
/// process environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageExecutionContext {
    pub package_name: String,
    pub package_path: PathBuf,
    pub working_directory: PathBuf,
    /// Canonical `https://<host>/<owner>/<name>` form of the remote.
    pub repository_url: String,
    pub repository_owner: String,
    pub repository_name: String,
    /// Name of the git remote the identity was read from.
    pub git_remote: String,
}

impl PackageExecutionContext {
    /// Resolve the context for one package by reading `remote` from the
    /// repository rooted at `package_path`. Fails when the remote is absent
    /// or unparseable; a package without an identity cannot run.
    pub fn resolve(package_name: &str, package_path: &Path, remote: &str) -> Result<Self> {
        let identity = convoy_git::resolve_identity(package_path, remote)
            .with_context(|| format!("package {package_name}: resolving repository identity"))?;

        let Some(identity) = identity else {
            bail!(
                "package {package_name}: no git remote {remote} configured in {}",
                package_path.display()
            );
        };

        let ctx = Self {
            package_name: package_name.to_string(),
            package_path: package_path.to_path_buf(),
            working_directory: package_path.to_path_buf(),
            repository_url: identity.canonical_url(),
            repository_owner: identity.owner,
            repository_name: identity.name,
            git_remote: remote.to_string(),
        };
        ctx.validate()?;
        Ok(ctx)
    }

    /// Check that every identity field is populated. Run before each
    /// dispatch; a context that fails validation keeps its package from
    /// being handed to the executor.
    pub fn validate(&self) -> Result<()> {
        let mut missing: Vec<&str> = Vec::new();
        if self.repository_url.is_empty() {
            missing.push("repository_url");
        }
        if self.repository_owner.is_empty() {
            missing.push("repository_owner");
        }
        if self.repository_name.is_empty() {
            missing.push("repository_name");
        }
        if self.package_path.as_os_str().is_empty() {
            missing.push("package_path");
        }
        if self.working_directory.as_os_str().is_empty() {
            missing.push("working_directory");
        }

        if !missing.is_empty() {
            bail!(
                "package {}: execution context is incomplete (missing {})",
                self.package_name,
                missing.join(", ")
            );
        }
        Ok(())
    }

    /// Environment variables carrying this identity into the child process.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        vec![
            ("CONTEXT_PACKAGE_NAME".to_string(), self.package_name.clone()),
            ("CONTEXT_REPOSITORY_URL".to_string(), self.repository_url.clone()),
            ("CONTEXT_REPOSITORY_OWNER".to_string(), self.repository_owner.clone()),
            ("CONTEXT_REPOSITORY_NAME".to_string(), self.repository_name.clone()),
            ("CONTEXT_GIT_REMOTE".to_string(), self.git_remote.clone()),
        ]
    }
}
