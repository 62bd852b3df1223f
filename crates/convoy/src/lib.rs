//! # Convoy
//!
//! A dependency-aware parallel execution engine for multi-package
//! workspaces.
//!
//! Convoy runs a command across every package in a workspace while
//! respecting the dependency graph between them: a package never starts
//! before its dependencies have finished. Independent packages run
//! concurrently up to a configurable cap, and the engine persists a
//! checkpoint after every state change so an interrupted run resumes from
//! exactly where it stopped.
//!
//! ## What it does
//!
//! - **Safe ordering** — a validated DAG with a deterministic topological
//!   build order; dependents wait for their dependencies.
//! - **Bounded parallelism** — slot-limited dispatch with priority
//!   scheduling: packages that unblock the most downstream work go first.
//! - **Failure containment** — errors are classified as transient or
//!   permanent; transient ones retry with exponential backoff, permanent
//!   ones cascade a skip to everything that transitively depends on them
//!   while the rest of the run continues.
//! - **Checkpointed recovery** — atomic, lock-protected persistence plus
//!   explicit operations (mark-completed, retry-failed, skip, reset) for
//!   getting a stuck run moving again.
//! - **Isolated package identity** — each package carries repository
//!   metadata resolved from its own directory, so concurrent executions
//!   never contaminate each other through ambient process state.
//!
//! ## Pipeline
//!
//! 1. Build a [`graph::PackageGraph`] from the workspace description.
//! 2. Construct a [`pool::TaskPool`] with a [`exec::PackageExecutor`]
//!    implementation and [`types::PoolOptions`].
//! 3. Call `execute`; subscribe an [`events::EventSink`] for progress.
//! 4. If the run is interrupted or fails, load the checkpoint through
//!    [`checkpoint::CheckpointStore`] and repair it with
//!    [`recovery::RecoveryManager`], then re-run with
//!    `continue_from_checkpoint`.
//!
//! ## Modules
//!
//! - [`graph`] — validated package DAG with forward/reverse edges
//! - [`deps`] — readiness predicates and graph-shape queries
//! - [`scheduler`] — priority ordering of the ready queue
//! - [`monitor`] — concurrency slots and the host memory probe
//! - [`state`] — the seven-bucket execution state and its transitions
//! - [`checkpoint`] — atomic, lock-protected checkpoint persistence
//! - [`pool`] — the main loop: dispatch, completion handling, cascade
//! - [`recovery`] — offline checkpoint mutations and validation
//! - [`context`] — per-package repository identity
//! - [`classify`] — failure taxonomy and retriability
//! - [`events`] — progress events and the reporter interface
//! - [`exec`] — the executor contract
//! - [`types`] — shared domain types

/// Validated package DAG with forward/reverse edges.
pub mod graph;

/// Readiness predicates and graph-shape queries.
pub mod deps;

/// Priority ordering of the ready queue.
pub mod scheduler;

/// Concurrency slots and the host memory probe.
pub mod monitor;

/// The seven-bucket execution state and its transitions.
pub mod state;

/// Atomic, lock-protected checkpoint persistence.
pub mod checkpoint;

/// The main loop: dispatch, completion handling, cascade.
pub mod pool;

/// Offline checkpoint mutations and validation.
pub mod recovery;

/// Per-package repository identity.
pub mod context;

/// Failure taxonomy and retriability.
pub mod classify;

/// Progress events and the reporter interface.
pub mod events;

/// The executor contract.
pub mod exec;

/// Shared domain types.
pub mod types;

/// Retry and backoff schedules.
/// Re-exported from the convoy-retry microcrate.
pub use convoy_retry as retry;

/// Shared test fixtures.
#[cfg(test)]
mod testutil;
