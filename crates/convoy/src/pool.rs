//! The task pool: the single-writer main loop that discovers ready work,
//! dispatches it under the concurrency cap, waits for the first completion,
//! records the outcome, and persists a checkpoint — until every package is
//! in a terminal bucket.
//!
//! Worker threads never touch shared state; they return results over a
//! channel and the loop applies them. The only state reachable from outside
//! the loop — the published-versions list — is serialised behind
//! [`SharedLog`] and handed out as defensive copies.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use chrono::Utc;

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::classify;
use crate::context::PackageExecutionContext;
use crate::events::{EventSink, PoolEvent, Reporter};
use crate::exec::{
    CancellationFlag, ExecutionError, ExecutionRequest, PackageExecutor, PackageOutcome,
};
use crate::graph::PackageGraph;
use crate::monitor::ResourceMonitor;
use crate::scheduler;
use crate::state::{Bucket, FailedPackage};
use crate::types::{
    EngineError, ExecutionMetrics, ExecutionResult, PoolOptions, PublishedVersion,
};

/// Mutex-guarded growable list with run-exclusive access semantics: the
/// lock is acquired, the closure runs, and the lock is released even when
/// the closure panics. Readers get defensive copies, never aliases.
#[derive(Debug, Default)]
pub struct SharedLog<T> {
    inner: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for SharedLog<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> SharedLog<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Run `f` with exclusive access to the list. A poisoned lock is
    /// recovered rather than propagated; the list stays usable.
    pub fn run_exclusive<R>(&self, f: impl FnOnce(&mut Vec<T>) -> R) -> R {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn push(&self, item: T) {
        self.run_exclusive(|items| items.push(item));
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Vec<T> {
        self.run_exclusive(|items| items.clone())
    }

    pub fn replace(&self, new_items: Vec<T>) {
        self.run_exclusive(|items| *items = new_items);
    }

    pub fn len(&self) -> usize {
        self.run_exclusive(|items| items.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of one finished package execution, delivered to the main loop.
struct Completion {
    name: String,
    outcome: Result<PackageOutcome, ExecutionError>,
}

/// Dependency-aware parallel execution pool.
pub struct TaskPool {
    graph: PackageGraph,
    executor: Arc<dyn PackageExecutor>,
    options: PoolOptions,
    store: CheckpointStore,
    monitor: ResourceMonitor,
    sinks: Vec<Box<dyn EventSink>>,
    contexts: BTreeMap<String, PackageExecutionContext>,
    published: SharedLog<PublishedVersion>,
    // In-memory only; never persisted.
    cancel_flags: BTreeMap<String, CancellationFlag>,
}

impl TaskPool {
    pub fn new(graph: PackageGraph, executor: Arc<dyn PackageExecutor>, options: PoolOptions) -> Self {
        let store = CheckpointStore::new(&options.checkpoint_dir);
        let monitor = ResourceMonitor::new(options.max_concurrency);
        Self {
            graph,
            executor,
            options,
            store,
            monitor,
            sinks: Vec::new(),
            contexts: BTreeMap::new(),
            published: SharedLog::new(),
            cancel_flags: BTreeMap::new(),
        }
    }

    /// Register an event subscriber. Sinks observe progress; they must not
    /// reach back into engine state.
    pub fn subscribe(&mut self, sink: Box<dyn EventSink>) {
        self.sinks.push(sink);
    }

    /// Supply a pre-resolved execution context. Contexts not provided here
    /// are resolved from each package's directory when the run starts.
    pub fn provide_context(&mut self, context: PackageExecutionContext) {
        self.contexts.insert(context.package_name.clone(), context);
    }

    /// Defensive copy of the published-artefact list.
    pub fn published_versions(&self) -> Vec<PublishedVersion> {
        self.published.snapshot()
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Request cancellation of a running package, best-effort.
    pub fn cancel(&self, name: &str) {
        if let Some(flag) = self.cancel_flags.get(name) {
            flag.cancel();
        }
    }

    /// Run the command across the whole graph. Returns once every package
    /// is in a terminal bucket, or propagates an internal error after
    /// persisting a checkpoint so the run stays recoverable.
    pub fn execute(&mut self, reporter: &mut dyn Reporter) -> Result<ExecutionResult> {
        if self.options.max_concurrency == 0 {
            anyhow::bail!("max_concurrency must be at least 1");
        }
        let run_started = Instant::now();

        self.resolve_contexts()?;
        let mut checkpoint = self.initial_checkpoint(reporter)?;

        reporter.info(&format!(
            "running {:?} across {} packages (max concurrency {})",
            self.options.command,
            self.graph.len(),
            self.options.max_concurrency
        ));
        self.emit(PoolEvent::ExecutionStarted {
            total_packages: self.graph.len(),
        });

        let (tx, rx) = channel::<Completion>();
        let loop_result = self.run_loop(&mut checkpoint, &tx, &rx, reporter);

        if let Err(err) = loop_result {
            // Keep the run recoverable before propagating.
            if let Err(save_err) = self.store.save(&mut checkpoint) {
                reporter.error(&format!("failed to persist checkpoint: {save_err:#}"));
            }
            return Err(err);
        }

        self.finish(checkpoint, run_started, reporter)
    }

    fn finish(
        &mut self,
        mut checkpoint: Checkpoint,
        run_started: Instant,
        reporter: &mut dyn Reporter,
    ) -> Result<ExecutionResult> {
        let state = &checkpoint.state;
        let monitor_metrics = self.monitor.metrics();
        let result = ExecutionResult {
            success: state.failed.is_empty(),
            total_packages: self.graph.len(),
            completed: state.completed.iter().cloned().collect(),
            failed: state.failed.keys().cloned().collect(),
            skipped: state.skipped.keys().cloned().collect(),
            skipped_no_changes: state.skipped_no_changes.keys().cloned().collect(),
            metrics: ExecutionMetrics {
                elapsed_ms: run_started.elapsed().as_millis() as u64,
                peak_concurrency: monitor_metrics.peak_concurrency,
                average_concurrency: monitor_metrics.average_concurrency,
                total_allocations: monitor_metrics.total_allocations,
            },
        };

        let clean = state.failed.is_empty() && state.skipped.is_empty();
        if clean {
            self.store.cleanup();
            reporter.info("execution finished cleanly; checkpoint removed");
        } else {
            self.store.save(&mut checkpoint)?;
            reporter.warn(&format!(
                "execution finished with {} failed and {} skipped packages; checkpoint kept for recovery",
                result.failed.len(),
                result.skipped.len()
            ));
        }

        self.emit(PoolEvent::ExecutionCompleted {
            success: result.success,
            completed: result.completed.len(),
            failed: result.failed.len(),
            skipped: result.skipped.len(),
        });

        Ok(result)
    }

    fn run_loop(
        &mut self,
        checkpoint: &mut Checkpoint,
        tx: &Sender<Completion>,
        rx: &Receiver<Completion>,
        reporter: &mut dyn Reporter,
    ) -> Result<()> {
        loop {
            while self.monitor.free_slots() > 0 && !checkpoint.state.ready.is_empty() {
                let picks = scheduler::next_batch(
                    &self.graph,
                    &checkpoint.state,
                    &checkpoint.retry_attempts,
                    self.monitor.free_slots(),
                );
                if picks.is_empty() {
                    break;
                }
                for name in picks {
                    self.dispatch(&name, checkpoint, tx, reporter)?;
                }
            }

            if checkpoint.state.is_finished() {
                return Ok(());
            }

            if checkpoint.state.running.is_empty() {
                checkpoint.state.refresh_ready(&self.graph);
                if checkpoint.state.ready.is_empty() {
                    if checkpoint.state.pending.is_empty() {
                        // Only terminal buckets left.
                        return Ok(());
                    }
                    return Err(EngineError::Deadlock(checkpoint.state.pending.len()).into());
                }
                continue;
            }

            let completion = rx
                .recv()
                .context("completion channel closed with packages still running")?;
            self.handle_completion(completion, checkpoint, reporter);
            self.monitor.release(1);
            checkpoint.state.refresh_ready(&self.graph);

            self.store.save(checkpoint)?;
            self.emit(PoolEvent::CheckpointSaved {
                timestamp: checkpoint.last_updated,
            });
        }
    }

    fn dispatch(
        &mut self,
        name: &str,
        checkpoint: &mut Checkpoint,
        tx: &Sender<Completion>,
        reporter: &mut dyn Reporter,
    ) -> Result<()> {
        if !self.monitor.try_allocate(1) {
            return Ok(());
        }
        if let Some(pressure) = self.monitor.memory_pressure() {
            reporter.warn(&format!(
                "host memory low: {:.1}% available",
                pressure.percent_available
            ));
        }

        let context = self
            .contexts
            .get(name)
            .cloned()
            .with_context(|| format!("missing execution context for {name}"))?;
        context.validate()?;
        let info = self
            .graph
            .package(name)
            .cloned()
            .with_context(|| format!("package {name} missing from graph"))?;

        let started_at = Utc::now();
        checkpoint.state.ready.retain(|n| n != name);
        checkpoint.state.running.insert(name.to_string(), started_at);
        checkpoint.start_times.insert(name.to_string(), started_at);

        let cancel = CancellationFlag::new();
        self.cancel_flags.insert(name.to_string(), cancel.clone());

        let index = checkpoint
            .build_order
            .iter()
            .position(|n| n == name)
            .unwrap_or(0);
        let request = ExecutionRequest {
            package: name.to_string(),
            info,
            command: self.options.command.clone(),
            config: self.options.original_config.clone(),
            dry_run: self.options.dry_run,
            index,
            total: checkpoint.build_order.len(),
            all_packages: checkpoint.build_order.clone(),
            is_builtin: self.options.is_builtin,
            context,
            cancel,
        };

        reporter.info(&format!("{name}: started"));
        self.emit(PoolEvent::PackageStarted {
            name: name.to_string(),
        });

        let executor = Arc::clone(&self.executor);
        let tx = tx.clone();
        thread::spawn(move || {
            let name = request.package.clone();
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| executor.execute(&request)))
                .unwrap_or_else(|_| {
                    Err(ExecutionError::new(format!("executor panicked running {name}")))
                });
            let _ = tx.send(Completion { name, outcome });
        });

        Ok(())
    }

    fn handle_completion(
        &mut self,
        completion: Completion,
        checkpoint: &mut Checkpoint,
        reporter: &mut dyn Reporter,
    ) {
        let name = completion.name;
        let started_at = checkpoint.state.running.remove(&name);
        self.cancel_flags.remove(&name);

        let finished_at = Utc::now();
        let duration_ms = started_at
            .map(|s| (finished_at - s).num_milliseconds().max(0) as u64)
            .unwrap_or(0);

        match completion.outcome {
            Ok(outcome) if !outcome.skipped_no_changes => {
                checkpoint.state.completed.insert(name.clone());
                checkpoint.end_times.insert(name.clone(), finished_at);
                checkpoint.durations_ms.insert(name.clone(), duration_ms);

                if let Some(version) = outcome.published_version {
                    self.published.push(PublishedVersion {
                        package: name.clone(),
                        version,
                    });
                    checkpoint.published_versions = self.published.snapshot();
                }

                reporter.info(&format!(
                    "{name}: completed in {}",
                    humantime::format_duration(Duration::from_millis(duration_ms))
                ));
                self.emit(PoolEvent::PackageCompleted { name, duration_ms });
            }
            Ok(outcome) => {
                let reason = outcome.skip_reason.unwrap_or_default().as_str().to_string();
                checkpoint
                    .state
                    .skipped_no_changes
                    .insert(name.clone(), reason.clone());
                checkpoint.end_times.insert(name.clone(), finished_at);
                checkpoint.durations_ms.insert(name.clone(), duration_ms);

                reporter.info(&format!("{name}: nothing to do ({reason})"));
                self.emit(PoolEvent::PackageSkippedNoChanges { name, reason });
            }
            Err(err) => {
                self.handle_failure(name, err, finished_at, duration_ms, checkpoint, reporter);
            }
        }
    }

    fn handle_failure(
        &mut self,
        name: String,
        err: ExecutionError,
        finished_at: chrono::DateTime<Utc>,
        duration_ms: u64,
        checkpoint: &mut Checkpoint,
        reporter: &mut dyn Reporter,
    ) {
        let attempts = {
            let entry = checkpoint.retry_attempts.entry(name.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        let kind = err
            .classification
            .unwrap_or_else(|| classify::classify(&err.message, err.detail.as_deref()));

        if kind.is_retriable() && self.options.retry.allows_retry(attempts) {
            let delay = convoy_retry::backoff_delay(&self.options.retry, attempts);
            reporter.warn(&format!(
                "{name}: {} (attempt {attempts}); retrying in {}",
                err.message,
                humantime::format_duration(delay)
            ));
            thread::sleep(delay);

            // Back to pending, not ready: readiness is re-checked against
            // the state the retry actually runs in.
            checkpoint.state.pending.insert(name.clone());
            self.emit(PoolEvent::PackageRetrying {
                name,
                attempt: attempts,
            });
            return;
        }

        let dependencies: Vec<String> = self
            .graph
            .dependencies_of(&name)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default();
        let dependents: Vec<String> = self.graph.transitive_dependents(&name).into_iter().collect();

        checkpoint.end_times.insert(name.clone(), finished_at);
        checkpoint.durations_ms.insert(name.clone(), duration_ms);
        checkpoint.state.failed.insert(
            name.clone(),
            FailedPackage {
                name: name.clone(),
                message: err.message.clone(),
                detail: err.detail.clone(),
                classification: kind,
                retriable: kind.is_retriable(),
                attempt: attempts,
                failed_at: finished_at,
                dependencies,
                dependents: dependents.clone(),
            },
        );

        reporter.error(&format!("{name}: failed: {}", err.message));
        self.emit(PoolEvent::PackageFailed {
            name: name.clone(),
            message: err.message,
            classification: kind,
        });

        // Cascade: everything transitively waiting on this package can no
        // longer run.
        for dependent in dependents {
            if matches!(
                checkpoint.state.bucket_of(&dependent),
                Some(Bucket::Pending) | Some(Bucket::Ready)
            ) {
                checkpoint.state.remove_everywhere(&dependent);
                let reason = format!("depends on failed {name}");
                checkpoint
                    .state
                    .skipped
                    .insert(dependent.clone(), reason.clone());
                reporter.warn(&format!("{dependent}: skipped ({reason})"));
                self.emit(PoolEvent::PackageSkipped {
                    name: dependent,
                    reason,
                });
            }
        }
    }

    /// Build the execution context for every package. Context resolution
    /// failures are fatal — no package runs without its identity.
    fn resolve_contexts(&mut self) -> Result<()> {
        for (name, info) in self.graph.packages() {
            if self.contexts.contains_key(name) {
                continue;
            }
            let context =
                PackageExecutionContext::resolve(name, &info.path, &self.options.git_remote)
                    .map_err(|e| EngineError::Context {
                        package: name.clone(),
                        reason: format!("{e:#}"),
                    })?;
            self.contexts.insert(name.clone(), context);
        }
        Ok(())
    }

    fn initial_checkpoint(&mut self, reporter: &mut dyn Reporter) -> Result<Checkpoint> {
        if self.options.continue_from_checkpoint {
            if let Some(loaded) = self.store.load()? {
                if loaded.from_backup {
                    reporter.warn("checkpoint was recovered from its backup copy");
                }
                let mut checkpoint = loaded.checkpoint;

                let expected: std::collections::BTreeSet<String> =
                    self.graph.packages().keys().cloned().collect();
                if checkpoint.package_set() != expected {
                    anyhow::bail!(
                        "checkpoint {} does not match the current package graph",
                        checkpoint.execution_id
                    );
                }

                // A prior run cannot be resumed mid-task: anything that was
                // in flight starts over.
                let interrupted: Vec<String> =
                    checkpoint.state.running.keys().cloned().collect();
                for name in interrupted {
                    checkpoint.state.running.remove(&name);
                    checkpoint.state.pending.insert(name);
                }

                // Skipped packages whose blockers were resolved offline
                // (e.g. marked completed) get another chance.
                checkpoint.state.unblock_skipped(&self.graph);
                checkpoint.state.refresh_ready(&self.graph);

                self.published.replace(checkpoint.published_versions.clone());
                reporter.info(&format!(
                    "resuming execution {} ({} of {} packages completed)",
                    checkpoint.execution_id,
                    checkpoint.state.completed.len(),
                    self.graph.len()
                ));

                self.store.save(&mut checkpoint)?;
                return Ok(checkpoint);
            }
            reporter.warn("no checkpoint found to continue from; starting fresh");
        }

        let execution_id = format!(
            "exec-{}-{}",
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ"),
            std::process::id()
        );
        let mut checkpoint = Checkpoint::new(&self.graph, &self.options, &execution_id);
        checkpoint.state.refresh_ready(&self.graph);
        self.store.save(&mut checkpoint)?;
        Ok(checkpoint)
    }

    fn emit(&mut self, event: PoolEvent) {
        for sink in &mut self.sinks {
            sink.on_event(&event);
        }
    }
}
