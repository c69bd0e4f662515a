pub(crate) mod execute;
mod ordered;

use crate::{
    config::ExecutorConfig,
    executor::{
        execute::call_facet,
        ordered::{Direction, OrderedPlan, join_unordered},
    },
    sync::lock,
    task::{TaskFailure, TaskState, node::TaskNode},
    transaction::Transaction,
    types::TaskId,
};
use derive_more::Debug;
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder, Yield};
use std::{sync::Arc, thread};
use thiserror::Error;
use tracing::{debug, error, warn};

/// Error returned by [`Executor::new`] when the worker pool cannot be built.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutorError {
    #[error("failed to build the worker pool: {0}")]
    ThreadPool(#[from] ThreadPoolBuildError),
}

/// Concurrent scheduler for transactional task graphs.
///
/// Key responsibilities:
/// - Owns the worker pool every transaction opened from it runs on.
/// - Runs a task's injections and executable facet as soon as the last of
///   its dependencies has executed, without any global barrier.
/// - Fans validate facets out over the pool, and runs commit and revert
///   facets in forward and reverse dependency order respectively.
///
/// Cloning is cheap; clones share the pool.
#[must_use]
#[derive(Debug, Clone)]
pub struct Executor {
    shared: Arc<ExecutorShared>,
}

#[derive(Debug)]
pub(crate) struct ExecutorShared {
    #[debug(skip)]
    pub(crate) pool: ThreadPool,
    config: ExecutorConfig,
}

impl Executor {
    /// Build the worker pool described by `config`.
    ///
    /// # Errors
    /// If the operating system refuses to spawn the worker threads.
    pub fn new(config: ExecutorConfig) -> Result<Self, ExecutorError> {
        let prefix = config.thread_name_prefix.clone();
        let mut builder =
            ThreadPoolBuilder::new().thread_name(move |index| format!("{prefix}-{index}"));
        if let Some(threads) = config.worker_threads {
            builder = builder.num_threads(threads.get());
        }
        let pool = builder.build()?;
        debug!(threads = pool.current_num_threads(), "executor started");
        Ok(Self {
            shared: Arc::new(ExecutorShared { pool, config }),
        })
    }

    /// [`Self::new`] with [`ExecutorConfig::from_env`].
    ///
    /// # Errors
    /// As for [`Self::new`].
    pub fn with_default_config() -> Result<Self, ExecutorError> {
        Self::new(ExecutorConfig::from_env())
    }

    /// Open a root transaction.
    pub fn new_transaction(&self) -> Transaction {
        Transaction::root(Arc::clone(&self.shared))
    }

    /// Number of threads in the worker pool.
    #[must_use]
    pub fn worker_threads(&self) -> usize {
        self.shared.pool.current_num_threads()
    }

    /// The configuration the pool was built from.
    pub fn config(&self) -> &ExecutorConfig {
        &self.shared.config
    }
}

impl ExecutorShared {
    /// Whether the calling thread is one of this executor's workers.
    pub(crate) fn on_worker(&self) -> bool {
        self.pool.current_thread_index().is_some()
    }

    /// Run one pending job of the pool on the calling worker, or give up the
    /// time slice when there is none.
    ///
    /// Workers that wait on the engine call this in a loop instead of
    /// parking, so the jobs they wait for can run on their own thread.
    pub(crate) fn help(&self) {
        debug_assert!(self.on_worker(), "ExecutorShared::help: [1]");
        if !matches!(rayon::yield_now(), Some(Yield::Executed)) {
            thread::yield_now();
        }
    }

    /// Run the validatable facet of every task in `nodes`, in no particular
    /// order, and return how many rejected their task.
    pub(crate) fn validate(&self, nodes: &[Arc<TaskNode>]) -> usize {
        self.pool
            .install(|| join_unordered(nodes, 0..nodes.len(), &validate_task))
    }

    /// Run committable facets, each task after its dependencies. Stops
    /// scheduling at the first failure.
    pub(crate) fn commit(&self, nodes: &[Arc<TaskNode>]) -> Result<(), (TaskId, TaskFailure)> {
        OrderedPlan::new(nodes, Direction::Forward).run(&self.pool, &commit_task)
    }

    /// Run revertible facets, each task after its dependents. Stops
    /// scheduling at the first failure.
    pub(crate) fn revert(&self, nodes: &[Arc<TaskNode>]) -> Result<(), (TaskId, TaskFailure)> {
        OrderedPlan::new(nodes, Direction::Reverse).run(&self.pool, &revert_task)
    }
}

/// Returns `false` if the task was rejected.
fn validate_task(node: &TaskNode) -> bool {
    node.set_state(TaskState::Validating);
    let validatable = lock(&node.work).validatable.take();
    let Some(mut validatable) = validatable else {
        node.set_state(TaskState::Validated);
        return true;
    };
    match call_facet(|| Ok(validatable.validate()?)) {
        Ok(()) => {
            node.set_state(TaskState::Validated);
            true
        }
        Err(failure) => {
            warn!(task = %node.id, %failure, "task rejected by validation");
            node.record_failure(failure);
            node.set_state(TaskState::ValidationFailed);
            false
        }
    }
}

fn commit_task(node: &TaskNode) -> Result<(), TaskFailure> {
    node.set_state(TaskState::Committing);
    let committable = lock(&node.work).committable.take();
    if let Some(mut committable) = committable {
        call_facet(|| Ok(committable.commit()?)).inspect_err(|failure| {
            error!(task = %node.id, %failure, "commit facet failed");
        })?;
    }
    node.set_state(TaskState::Committed);
    Ok(())
}

fn revert_task(node: &TaskNode) -> Result<(), TaskFailure> {
    node.set_state(TaskState::RollingBack);
    let revertible = lock(&node.work).revertible.take();
    if let Some(mut revertible) = revertible {
        call_facet(|| Ok(revertible.revert()?)).inspect_err(|failure| {
            error!(task = %node.id, %failure, "revert facet failed");
        })?;
    }
    node.set_state(TaskState::RolledBack);
    Ok(())
}
