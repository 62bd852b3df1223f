//! Durable checkpoint persistence: atomic writes, an advisory lock file,
//! a last-known-good backup, and schema-version gating.
//!
//! A checkpoint is written after every state-changing event, so a killed
//! run can resume from exactly where it stopped. All disk access happens
//! under the lock; the lock is held only for the window around the rename.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::graph::PackageGraph;
use crate::state::ExecutionState;
use crate::types::{EngineError, PackageInfo, PoolOptions, PublishedVersion, RecoveryHint};

/// Current checkpoint schema version.
pub const CURRENT_CHECKPOINT_VERSION: &str = "convoy.checkpoint.v1";

pub const CHECKPOINT_FILE: &str = "checkpoint.json";
pub const CHECKPOINT_TMP_FILE: &str = "checkpoint.json.tmp";
pub const CHECKPOINT_LOCK_FILE: &str = "checkpoint.json.lock";
pub const CHECKPOINT_BACKUP_FILE: &str = "checkpoint.json.backup";

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

/// The durable projection of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub schema_version: String,
    pub execution_id: String,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub command: String,
    pub mode: String,
    /// The caller's configuration, persisted verbatim.
    pub original_config: serde_json::Value,
    pub graph_snapshot: BTreeMap<String, PackageInfo>,
    pub build_order: Vec<String>,
    pub max_concurrency: usize,
    pub state: ExecutionState,
    pub published_versions: Vec<PublishedVersion>,
    pub retry_attempts: BTreeMap<String, u32>,
    pub start_times: BTreeMap<String, DateTime<Utc>>,
    pub end_times: BTreeMap<String, DateTime<Utc>>,
    pub durations_ms: BTreeMap<String, u64>,
    pub total_start_time: DateTime<Utc>,
    pub recovery_hints: Vec<RecoveryHint>,
    pub can_recover: bool,
}

impl Checkpoint {
    /// Fresh checkpoint for a run over `graph`, every package pending.
    pub fn new(graph: &PackageGraph, options: &PoolOptions, execution_id: &str) -> Self {
        let now = Utc::now();
        Self {
            schema_version: CURRENT_CHECKPOINT_VERSION.to_string(),
            execution_id: execution_id.to_string(),
            created_at: now,
            last_updated: now,
            command: options.command.clone(),
            mode: options.mode.clone(),
            original_config: options.original_config.clone(),
            graph_snapshot: graph.packages().clone(),
            build_order: graph.build_order().to_vec(),
            max_concurrency: options.max_concurrency,
            state: ExecutionState::with_all_pending(graph.build_order().iter().cloned()),
            published_versions: Vec::new(),
            retry_attempts: BTreeMap::new(),
            start_times: BTreeMap::new(),
            end_times: BTreeMap::new(),
            durations_ms: BTreeMap::new(),
            total_start_time: now,
            recovery_hints: Vec::new(),
            can_recover: true,
        }
    }

    /// Names of every package this checkpoint knows about.
    pub fn package_set(&self) -> BTreeSet<String> {
        self.graph_snapshot.keys().cloned().collect()
    }

    /// Structural validation: the state must partition the package set.
    pub fn validate(&self) -> Result<()> {
        let issues = self.state.partition_violations(&self.package_set());
        if !issues.is_empty() {
            bail!("checkpoint state is inconsistent: {}", issues.join("; "));
        }
        Ok(())
    }
}

/// A checkpoint read back from disk, noting whether it came from the
/// backup file.
#[derive(Debug, Clone)]
pub struct LoadedCheckpoint {
    pub checkpoint: Checkpoint,
    pub from_backup: bool,
}

/// Metadata written into the lock file so a stale holder is diagnosable.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    hostname: String,
    acquired_at: DateTime<Utc>,
}

/// Held lock; removing the file on drop is best-effort.
#[derive(Debug)]
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Directory-backed checkpoint persistence.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    lock_stale_after: Duration,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock_stale_after: DEFAULT_LOCK_STALE_AFTER,
        }
    }

    /// Shorten the stale-lock window. Tests use this; production keeps the
    /// 30 second default.
    pub fn with_lock_stale_after(mut self, window: Duration) -> Self {
        self.lock_stale_after = window;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE)
    }

    fn tmp_path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_TMP_FILE)
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_LOCK_FILE)
    }

    pub fn backup_path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_BACKUP_FILE)
    }

    pub fn exists(&self) -> bool {
        self.checkpoint_path().exists()
    }

    /// Persist atomically: stamp, validate, write to the temp path, rename
    /// over the canonical file. Refuses to persist a state that violates
    /// the partition invariant.
    pub fn save(&self, checkpoint: &mut Checkpoint) -> Result<()> {
        checkpoint.schema_version = CURRENT_CHECKPOINT_VERSION.to_string();
        checkpoint.last_updated = Utc::now();
        checkpoint.validate()?;

        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create checkpoint dir {}", self.dir.display()))?;

        let _lock = self.acquire_lock()?;

        let data = serde_json::to_vec_pretty(checkpoint)
            .context("failed to serialize checkpoint JSON")?;
        let tmp = self.tmp_path();
        {
            let mut f = fs::File::create(&tmp)
                .with_context(|| format!("failed to create tmp file {}", tmp.display()))?;
            f.write_all(&data)
                .with_context(|| format!("failed to write tmp file {}", tmp.display()))?;
            f.sync_all().ok();
        }

        let canonical = self.checkpoint_path();
        fs::rename(&tmp, &canonical).with_context(|| {
            format!(
                "failed to rename tmp file {} to {}",
                tmp.display(),
                canonical.display()
            )
        })?;
        fsync_parent_dir(&canonical);

        Ok(())
    }

    /// Read the checkpoint back. Missing canonical file means no resume
    /// state. A canonical file that fails to parse or validate falls back
    /// to the backup; an incompatible schema version is refused outright.
    pub fn load(&self) -> Result<Option<LoadedCheckpoint>> {
        let canonical = self.checkpoint_path();
        if !canonical.exists() {
            return Ok(None);
        }

        let _lock = self.acquire_lock()?;

        match read_checkpoint(&canonical) {
            Ok(checkpoint) => {
                check_schema_version(&checkpoint.schema_version)?;
                Ok(Some(LoadedCheckpoint {
                    checkpoint,
                    from_backup: false,
                }))
            }
            Err(_) => {
                let backup = self.backup_path();
                if !backup.exists() {
                    return Ok(None);
                }
                match read_checkpoint(&backup) {
                    Ok(checkpoint) => {
                        check_schema_version(&checkpoint.schema_version)?;
                        Ok(Some(LoadedCheckpoint {
                            checkpoint,
                            from_backup: true,
                        }))
                    }
                    Err(_) => Ok(None),
                }
            }
        }
    }

    /// Copy the canonical checkpoint to the backup file, when it exists.
    pub fn backup(&self) -> Result<()> {
        let canonical = self.checkpoint_path();
        if !canonical.exists() {
            return Ok(());
        }
        let _lock = self.acquire_lock()?;
        fs::copy(&canonical, self.backup_path()).with_context(|| {
            format!("failed to back up checkpoint {}", canonical.display())
        })?;
        Ok(())
    }

    /// Remove every checkpoint file, best-effort.
    pub fn cleanup(&self) {
        for path in [
            self.checkpoint_path(),
            self.tmp_path(),
            self.lock_path(),
            self.backup_path(),
        ] {
            let _ = fs::remove_file(path);
        }
    }

    /// Exclusive-create the lock file, writing the holder's pid, hostname
    /// and timestamp. Polls every 100 ms while held elsewhere; after the
    /// stale window the lock is deleted and creation retried once.
    fn acquire_lock(&self) -> Result<LockGuard> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create checkpoint dir {}", self.dir.display()))?;

        let path = self.lock_path();
        let started = Instant::now();

        loop {
            match try_create_lock(&path) {
                Ok(()) => return Ok(LockGuard { path }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if started.elapsed() >= self.lock_stale_after {
                        let _ = fs::remove_file(&path);
                        try_create_lock(&path).with_context(|| {
                            format!(
                                "failed to take over stale lock {}",
                                path.display()
                            )
                        })?;
                        return Ok(LockGuard { path });
                    }
                    thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("failed to create lock file {}", path.display())
                    });
                }
            }
        }
    }
}

fn try_create_lock(path: &Path) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let info = LockInfo {
        pid: std::process::id(),
        hostname: gethostname::gethostname().to_string_lossy().to_string(),
        acquired_at: Utc::now(),
    };
    let json = serde_json::to_string_pretty(&info).map_err(io::Error::other)?;
    file.write_all(json.as_bytes())?;
    file.sync_all().ok();
    Ok(())
}

fn read_checkpoint(path: &Path) -> Result<Checkpoint> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read checkpoint file {}", path.display()))?;
    let checkpoint: Checkpoint = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse checkpoint JSON {}", path.display()))?;
    checkpoint.validate()?;
    Ok(checkpoint)
}

fn check_schema_version(version: &str) -> Result<()> {
    let found = parse_schema_version(version)?;
    let current = parse_schema_version(CURRENT_CHECKPOINT_VERSION)?;
    if found != current {
        return Err(EngineError::SchemaMismatch {
            found: version.to_string(),
            expected: CURRENT_CHECKPOINT_VERSION.to_string(),
        }
        .into());
    }
    Ok(())
}

/// Major version number from a `convoy.checkpoint.vN` string.
fn parse_schema_version(version: &str) -> Result<u32> {
    let parts: Vec<&str> = version.split('.').collect();
    if parts.len() != 3 || parts[0] != "convoy" || !parts[2].starts_with('v') {
        bail!("invalid schema version format: {version}");
    }
    parts[2][1..]
        .parse::<u32>()
        .with_context(|| format!("invalid version number in schema version: {version}"))
}

/// Best-effort fsync of the parent directory after a rename, so the
/// directory entry update survives a crash. Not all platforms support
/// opening a directory for sync; errors are ignored.
fn fsync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent()
        && let Ok(dir) = fs::File::open(parent)
    {
        let _ = dir.sync_all();
    }
}
