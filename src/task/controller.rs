use crate::{
    task::{TaskFailure, TaskOutcome, TaskState, node::TaskNode},
    types::{TaskId, TransactionId},
    utils::panic_message,
};
use core::{any::Any, fmt, marker::PhantomData, panic::AssertUnwindSafe};
use derive_more::Deref;
use std::{panic, sync::Arc};
use tracing::warn;

/// Untyped handle to a released task.
///
/// Used to declare dependencies and to observe a task without knowing its
/// result type. All reads are safe from any thread.
#[derive(Clone)]
pub struct TaskHandle {
    pub(crate) node: Arc<TaskNode>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.node.id
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.node.transaction
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.node.state()
    }

    /// Ids of the tasks this one waits for, in declaration order.
    #[must_use]
    pub fn dependencies(&self) -> Vec<TaskId> {
        self.node.deps().iter().map(|dep| dep.id).collect()
    }

    /// Why the task failed execution or validation, if it did.
    #[must_use]
    pub fn failure(&self) -> Option<TaskFailure> {
        self.node.failure().cloned()
    }

    /// The execution outcome, if the task has one yet.
    #[must_use]
    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.node.completion.get()
    }

    /// Block until the task has an execution outcome.
    ///
    /// Called from a facet, the wait keeps running pool jobs on the calling
    /// worker instead of parking it.
    pub fn wait(&self) -> TaskOutcome {
        let owner = self.node.owner.upgrade();
        let Some(executor) = owner.map(|txn| Arc::clone(&txn.executor)) else {
            return self.node.completion.wait();
        };
        if !executor.on_worker() {
            return self.node.completion.wait();
        }
        loop {
            if let Some(outcome) = self.node.completion.get() {
                return outcome;
            }
            executor.help();
        }
    }

    /// The subtask object the task was built around, if it is an `S`.
    #[must_use]
    pub fn subtask<S: Any>(&self) -> Option<&S> {
        self.node.subtask.downcast_ref()
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.node, f)
    }
}

/// Typed handle to a released task, exposing its result.
///
/// Dereferences to [`TaskHandle`] for everything that does not depend on
/// the result type.
#[derive(Deref)]
pub struct TaskController<T> {
    #[deref]
    handle: TaskHandle,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TaskController<T> {
    pub(crate) fn new(node: Arc<TaskNode>) -> Self {
        Self {
            handle: TaskHandle { node },
            _marker: PhantomData,
        }
    }

    pub fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    pub fn into_handle(self) -> TaskHandle {
        self.handle
    }

    /// Run `listener` exactly once with the task's execution outcome.
    ///
    /// If the task already has an outcome the listener runs right away on
    /// the calling thread; otherwise it runs on the thread that produces the
    /// outcome. A panicking listener is logged and otherwise ignored.
    pub fn on_complete<L>(&self, listener: L)
    where
        T: 'static,
        L: FnOnce(&TaskController<T>, &TaskOutcome) + Send + 'static,
    {
        let listening = self.clone();
        self.handle.node.completion.on_complete(move |outcome| {
            let task = listening.id();
            let notified = panic::catch_unwind(AssertUnwindSafe(|| listener(&listening, outcome)));
            if let Err(payload) = notified {
                warn!(
                    task = %task,
                    panic = %panic_message(&*payload),
                    "completion listener panicked"
                );
            }
        });
    }
}

impl<T: 'static> TaskController<T> {
    /// The value produced by the executable facet.
    ///
    /// `None` until the task has executed, and for tasks without an
    /// executable.
    #[must_use]
    pub fn result(&self) -> Option<&T> {
        self.handle.node.result()?.downcast_ref()
    }
}

impl<T> Clone for TaskController<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for TaskController<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TaskController").field(&self.handle.node).finish()
    }
}
