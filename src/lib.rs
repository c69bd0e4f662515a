//! In-process transactional task execution engine.
//!
//! This crate coordinates a directed acyclic graph of interdependent tasks,
//! grouped under (possibly nested) transactions, through a four-phase
//! lifecycle: execute, validate, commit, or roll back. It:
//! - Lets callers build tasks incrementally through a [`task::TaskBuilder`],
//!   wiring dependencies, value injections and up to four optional facets
//!   (executable, validatable, revertible, committable).
//! - Runs each released task on a worker thread as soon as all of its
//!   dependencies have executed, using per-task readiness counters so that
//!   independent tasks run in parallel without a global barrier.
//! - Drives a transaction through validation and commit (forward dependency
//!   order) or rollback (reverse dependency order) when its caller asks it to
//!   advance, and enforces that nested transactions finish before their
//!   parent moves on.
//!
//! Key modules:
//! - `executor`: the worker pool and the scheduling of facet calls.
//! - `transaction`: transaction scoping, nesting and the phase protocol.
//! - `task`: facets, builders, controllers and per-task lifecycle states.
//! - `value`: single-assignment slots used to pass results between tasks.
//! - `completion`: the one-shot signal behind completion listeners.
//!
//! Quick start:
//! 1. Create an [`executor::Executor`] and open a root transaction with
//!    [`executor::Executor::new_transaction`].
//! 2. Obtain builders with [`transaction::Transaction::new_task`], declare
//!    dependencies and injections, then `release` each builder.
//! 3. Call [`transaction::Transaction::commit`] to wait for execution,
//!    validate and commit, or [`transaction::Transaction::rollback`] to undo.
//!
//! A task's facets never run before all of its dependencies have executed,
//! and its injections are applied, in declaration order, right before its
//! executable facet.

/// One-shot completion signal.
///
/// Resolves exactly once and delivers the value to every registered
/// callback, including callbacks registered after resolution.
pub mod completion;
/// Executor configuration.
///
/// Exposes `ExecutorConfig`, which controls the size and naming of the
/// worker pool.
pub mod config;
/// The concurrent task scheduler.
///
/// Owns the worker pool, runs executable facets as tasks become ready and
/// fans out validate, commit and revert facets in dependency order.
pub mod executor;
mod sync;
/// Task definitions: facets, builders, controllers and lifecycle states.
pub mod task;
/// Transactions, their nesting rules and the phase protocol.
pub mod transaction;
/// Core identifiers and collection aliases used across the crate.
pub mod types;
mod utils;
/// Single-assignment value slots used for injections.
pub mod value;
