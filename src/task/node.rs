use crate::{
    completion::Completion,
    sync::{Mutex, lock},
    task::{Committable, Revertible, TaskFailure, TaskOutcome, TaskState, Validatable},
    transaction::TxnInner,
    types::{HashSet, TaskId, TransactionId},
    value::ValueError,
};
use core::{
    any::Any,
    fmt, mem,
    sync::atomic::{AtomicU8, AtomicUsize, Ordering},
};
use rustc_hash::FxBuildHasher;
use std::sync::{Arc, OnceLock, Weak};
use tracing::trace;

pub(crate) type AnyValue = Box<dyn Any + Send + Sync>;
pub(crate) type ErasedExecutable = Box<dyn FnMut() -> anyhow::Result<AnyValue> + Send>;
pub(crate) type Injection = Box<dyn FnOnce() -> Result<(), ValueError> + Send>;
pub(crate) type OutwardInjection = Box<dyn FnOnce(&(dyn Any + Send + Sync)) -> Result<(), ValueError> + Send>;

/// Everything a task runs, moved out piece by piece as phases consume it.
#[derive(Default)]
pub(crate) struct Work {
    pub(crate) executable: Option<ErasedExecutable>,
    pub(crate) injections: Vec<Injection>,
    pub(crate) outward: Vec<OutwardInjection>,
    pub(crate) validatable: Option<Box<dyn Validatable>>,
    pub(crate) revertible: Option<Box<dyn Revertible>>,
    pub(crate) committable: Option<Box<dyn Committable>>,
}

/// Execution-phase part of [`Work`].
pub(crate) struct ExecutionWork {
    pub(crate) executable: Option<ErasedExecutable>,
    pub(crate) injections: Vec<Injection>,
    pub(crate) outward: Vec<OutwardInjection>,
}

/// What a dependent learns when it registers with one of its dependencies.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Registration {
    /// The dependency already executed; nothing to wait for.
    Satisfied,
    /// The dependency will never execute.
    Failed,
    /// The dependent was queued and will be notified.
    Pending,
}

/// A task in its transaction's arena.
///
/// State is a lock-free atomic. The dependency list is frozen at release.
/// Moves out of `Released` happen under the `dependents` lock, except for the
/// scheduler's claim, which only ever races with cancellation (both are
/// compare-and-swap, so exactly one wins).
#[must_use]
pub(crate) struct TaskNode {
    pub(crate) id: TaskId,
    pub(crate) transaction: TransactionId,
    pub(crate) owner: Weak<TxnInner>,
    state: AtomicU8,
    deps: OnceLock<Vec<Arc<TaskNode>>>,
    dependents: Mutex<Vec<Weak<TaskNode>>>,
    /// Dependencies that have not executed yet, plus one release guard.
    pending: AtomicUsize,
    result: OnceLock<AnyValue>,
    failure: OnceLock<TaskFailure>,
    pub(crate) work: Mutex<Work>,
    pub(crate) subtask: Arc<dyn Any + Send + Sync>,
    pub(crate) completion: Completion<TaskOutcome>,
}

impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNode")
            .field("id", &self.id)
            .field("transaction", &self.transaction)
            .field("state", &self.state())
            .field(
                "deps",
                &self.deps().iter().map(|dep| dep.id).collect::<Vec<_>>(),
            )
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .field("failure", &self.failure.get())
            .finish_non_exhaustive()
    }
}

impl TaskNode {
    pub(crate) fn new(
        transaction: TransactionId,
        owner: Weak<TxnInner>,
        subtask: Arc<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            id: TaskId::next(),
            transaction,
            owner,
            state: AtomicU8::new(TaskState::Created as u8),
            deps: OnceLock::new(),
            dependents: Mutex::new(Vec::new()),
            pending: AtomicUsize::new(0),
            result: OnceLock::new(),
            failure: OnceLock::new(),
            work: Mutex::new(Work::default()),
            subtask,
            completion: Completion::new(),
        }
    }

    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Unconditional transition, for states owned by a single phase driver.
    pub(crate) fn set_state(&self, to: TaskState) {
        let from = TaskState::from_u8(self.state.swap(to as u8, Ordering::AcqRel));
        trace!(task = %self.id, ?from, ?to, "task state");
    }

    /// Compare-and-swap transition. Returns `false` if the task was not in
    /// `from`.
    pub(crate) fn transition(&self, from: TaskState, to: TaskState) -> bool {
        let swapped = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            trace!(task = %self.id, ?from, ?to, "task state");
        }
        swapped
    }

    pub(crate) fn deps(&self) -> &[Arc<TaskNode>] {
        self.deps.get().map_or(&[], Vec::as_slice)
    }

    /// Freeze the dependency list and arm the readiness counter with one
    /// extra release guard, dropped by [`Self::dependency_resolved`] once
    /// registration is over.
    pub(crate) fn freeze_deps(&self, deps: Vec<Arc<TaskNode>>) {
        self.pending.store(deps.len() + 1, Ordering::Release);
        let fresh = self.deps.set(deps).is_ok();
        assert!(fresh, "TaskNode::freeze_deps: [1]");
    }

    /// Count one dependency (or the release guard) as resolved. Returns
    /// `true` for the caller that resolved the last one, which must schedule
    /// the task.
    pub(crate) fn dependency_resolved(&self) -> bool {
        self.pending.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Whether `target` is this task or one of its transitive dependencies.
    pub(crate) fn reaches(&self, target: TaskId) -> bool {
        let mut visited = HashSet::with_capacity_and_hasher(8, FxBuildHasher);
        let mut stack: Vec<&TaskNode> = vec![self];
        while let Some(node) = stack.pop() {
            if node.id == target {
                return true;
            }
            if !visited.insert(node.id) {
                continue;
            }
            stack.extend(node.deps().iter().map(Arc::as_ref));
        }
        false
    }

    /// Queue `dependent` for notification unless this task has already left
    /// the pre-execution states.
    pub(crate) fn register_dependent(&self, dependent: &Arc<TaskNode>) -> Registration {
        let mut dependents = lock(&self.dependents);
        match self.state() {
            TaskState::Created | TaskState::Released | TaskState::Executing => {
                dependents.push(Arc::downgrade(dependent));
                Registration::Pending
            }
            TaskState::ExecutionFailed | TaskState::RolledBack => Registration::Failed,
            TaskState::Executed
            | TaskState::Validating
            | TaskState::Validated
            | TaskState::ValidationFailed
            | TaskState::Committing
            | TaskState::Committed
            | TaskState::RollingBack => Registration::Satisfied,
        }
    }

    /// Leave `from` for `to`, recording `failure` first, and hand back the
    /// dependents that were waiting. `None` if the task was not in `from`.
    pub(crate) fn settle(
        &self,
        from: TaskState,
        to: TaskState,
        failure: Option<TaskFailure>,
    ) -> Option<Vec<Arc<TaskNode>>> {
        let mut dependents = lock(&self.dependents);
        if self.state() != from {
            return None;
        }
        if let Some(failure) = failure {
            let _ = self.failure.set(failure);
        }
        let swapped = self.transition(from, to);
        assert!(swapped, "TaskNode::settle: [1]");
        Some(
            mem::take(&mut *dependents)
                .iter()
                .filter_map(Weak::upgrade)
                .collect(),
        )
    }

    pub(crate) fn store_result(&self, value: AnyValue) {
        let fresh = self.result.set(value).is_ok();
        assert!(fresh, "TaskNode::store_result: [1]");
    }

    pub(crate) fn result(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.result.get().map(AsRef::as_ref)
    }

    /// Record a failure outside of [`Self::settle`], for validation.
    pub(crate) fn record_failure(&self, failure: TaskFailure) {
        let _ = self.failure.set(failure);
    }

    pub(crate) fn failure(&self) -> Option<&TaskFailure> {
        self.failure.get()
    }

    pub(crate) fn take_execution_work(&self) -> ExecutionWork {
        let mut work = lock(&self.work);
        ExecutionWork {
            executable: work.executable.take(),
            injections: mem::take(&mut work.injections),
            outward: mem::take(&mut work.outward),
        }
    }
}
