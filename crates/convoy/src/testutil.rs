//! Shared fixtures for the crate's tests: graph builders, canned execution
//! contexts, and a scriptable executor.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use convoy_retry::RetryConfig;

use crate::context::PackageExecutionContext;
use crate::events::{EventSink, PoolEvent};
use crate::exec::{
    ExecutionError, ExecutionRequest, PackageExecutor, PackageOutcome, SkipReason,
};
use crate::graph::PackageGraph;
use crate::pool::TaskPool;
use crate::types::{PackageInfo, PoolOptions};

pub fn pkg(name: &str, deps: &[&str]) -> PackageInfo {
    PackageInfo::new(
        name,
        "1.0.0",
        format!("/w/{name}"),
        deps.iter().map(|d| d.to_string()),
    )
}

pub fn graph_from(spec: &[(&str, &[&str])]) -> PackageGraph {
    PackageGraph::new(spec.iter().map(|(name, deps)| pkg(name, deps))).expect("valid graph")
}

pub fn dummy_context(name: &str) -> PackageExecutionContext {
    PackageExecutionContext {
        package_name: name.to_string(),
        package_path: format!("/w/{name}").into(),
        working_directory: format!("/w/{name}").into(),
        repository_url: format!("https://github.com/acme/{name}"),
        repository_owner: "acme".to_string(),
        repository_name: name.to_string(),
        git_remote: "origin".to_string(),
    }
}

/// Options with a no-delay retry schedule so tests never sleep through
/// real backoff.
pub fn test_options(checkpoint_dir: &Path) -> PoolOptions {
    let mut options = PoolOptions::new("build", 2, checkpoint_dir);
    options.retry = RetryConfig::immediate(3);
    options
}

/// A pool over `graph` with canned contexts for every package, so tests
/// never shell out to git.
pub fn pool_for(
    graph: &PackageGraph,
    executor: Arc<dyn PackageExecutor>,
    options: PoolOptions,
) -> TaskPool {
    let mut pool = TaskPool::new(graph.clone(), executor, options);
    for name in graph.packages().keys() {
        pool.provide_context(dummy_context(name));
    }
    pool
}

/// One scripted attempt outcome.
#[derive(Debug, Clone)]
pub enum Step {
    Ok,
    Skip(SkipReason),
    Fail(ExecutionError),
    Publish(String),
    Panic,
}

/// Executor driven by per-package scripts. Unscripted attempts succeed.
/// Tracks in-flight concurrency and the order packages finished in.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<BTreeMap<String, VecDeque<Step>>>,
    fallbacks: BTreeMap<String, Step>,
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    finished: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every execution, to force overlap.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Consume `steps` one per attempt for `name`; later attempts succeed.
    pub fn scripted(self, name: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .expect("scripts lock")
            .insert(name.to_string(), steps.into());
        self
    }

    /// Every attempt for `name` fails with `error`.
    pub fn failing(mut self, name: &str, error: ExecutionError) -> Self {
        self.fallbacks.insert(name.to_string(), Step::Fail(error));
        self
    }

    /// `name` succeeds and reports a published artefact.
    pub fn publishing(mut self, name: &str, version: &str) -> Self {
        self.fallbacks
            .insert(name.to_string(), Step::Publish(version.to_string()));
        self
    }

    /// Every attempt for `name` panics.
    pub fn panicking(mut self, name: &str) -> Self {
        self.fallbacks.insert(name.to_string(), Step::Panic);
        self
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Names in the order their executions finished.
    pub fn completion_order(&self) -> Vec<String> {
        self.finished.lock().expect("finished lock").clone()
    }

    fn next_step(&self, name: &str) -> Step {
        let mut scripts = self.scripts.lock().expect("scripts lock");
        if let Some(queue) = scripts.get_mut(name)
            && let Some(step) = queue.pop_front()
        {
            return step;
        }
        self.fallbacks.get(name).cloned().unwrap_or(Step::Ok)
    }
}

impl PackageExecutor for ScriptedExecutor {
    fn execute(&self, request: &ExecutionRequest) -> Result<PackageOutcome, ExecutionError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);

        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let step = self.next_step(&request.package);
        self.finished
            .lock()
            .expect("finished lock")
            .push(request.package.clone());
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match step {
            Step::Ok => Ok(PackageOutcome::success()),
            Step::Skip(reason) => Ok(PackageOutcome::skipped(reason)),
            Step::Fail(error) => Err(error),
            Step::Publish(version) => Ok(PackageOutcome::published(version)),
            Step::Panic => panic!("scripted panic for {}", request.package),
        }
    }
}

/// Reporter that collects its lines, for asserting on log output.
#[derive(Debug, Default)]
pub struct VecReporter {
    pub infos: Vec<String>,
    pub warns: Vec<String>,
    pub errors: Vec<String>,
}

impl crate::events::Reporter for VecReporter {
    fn info(&mut self, msg: &str) {
        self.infos.push(msg.to_string());
    }

    fn warn(&mut self, msg: &str) {
        self.warns.push(msg.to_string());
    }

    fn error(&mut self, msg: &str) {
        self.errors.push(msg.to_string());
    }
}

/// Event sink backed by a shared list, cloneable into the pool while the
/// test keeps a handle.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<PoolEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PoolEvent> {
        self.events.lock().expect("events lock").clone()
    }
}

impl EventSink for RecordingSink {
    fn on_event(&mut self, event: &PoolEvent) {
        self.events.lock().expect("events lock").push(event.clone());
    }
}
