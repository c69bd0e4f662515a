use crate::{
    executor::execute::{propagate_failure, schedule},
    task::{
        Committable, Executable, Facets, Revertible, TaskController, TaskHandle, TaskOutcome,
        TaskState, Validatable,
        node::{AnyValue, ErasedExecutable, Injection, OutwardInjection, Registration, TaskNode, Work},
    },
    sync::lock,
    transaction::{Transaction, TransactionPhase, TxnInner},
    types::{IndexMap, TaskId, TransactionId},
    value::{ReadableValue, ValueError, WritableValue},
};
use core::{
    any::{Any, type_name},
    fmt, mem,
};
use rustc_hash::FxBuildHasher;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Configuration error raised synchronously by [`TaskBuilder`] operations.
///
/// A failed operation leaves the builder and the task graph unchanged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TaskBuilderError {
    /// The dependency belongs to a transaction that is neither the builder's
    /// transaction nor one of its ancestors.
    #[error(
        "{dependency} belongs to {dependency_transaction}, which is not {transaction} or one of its ancestors"
    )]
    InvalidTransactionScope {
        dependency: TaskId,
        dependency_transaction: TransactionId,
        transaction: TransactionId,
    },
    /// The builder was already released.
    #[error("builder of {0} was already released")]
    IllegalState(TaskId),
    /// The dependency would close a cycle.
    #[error("{task} cannot depend on {dependency}: the edge would close a cycle")]
    Cycle { task: TaskId, dependency: TaskId },
    /// The owning transaction no longer accepts tasks.
    #[error("{transaction} is {phase:?} and no longer accepts tasks")]
    TransactionNotActive {
        transaction: TransactionId,
        phase: TransactionPhase,
    },
}

/// Single-use builder of a task.
///
/// Obtained from [`Transaction::new_task`] or [`Transaction::build_task`].
/// Dependencies, injections and facets are accumulated here and frozen by
/// [`Self::release`]. Once released, every mutator fails with
/// [`TaskBuilderError::IllegalState`].
///
/// Dropping a builder without releasing it discards the task; it never
/// enters the transaction.
#[must_use]
pub struct TaskBuilder<T> {
    transaction: Arc<TxnInner>,
    node: Arc<TaskNode>,
    deps: IndexMap<TaskId, Arc<TaskNode>>,
    injections: Vec<Injection>,
    outward: Vec<OutwardInjection>,
    facets: Facets<T>,
    released: bool,
}

impl<T> fmt::Debug for TaskBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskBuilder")
            .field("task", &self.node.id)
            .field("transaction", &self.transaction.id)
            .field("deps", &self.deps.keys().collect::<Vec<_>>())
            .field("injections", &self.injections.len())
            .field("outward_injections", &self.outward.len())
            .field("facets", &self.facets)
            .field("released", &self.released)
            .finish()
    }
}

impl<T: Send + Sync + 'static> TaskBuilder<T> {
    pub(crate) fn new(
        transaction: Arc<TxnInner>,
        subtask: Arc<dyn Any + Send + Sync>,
        facets: Facets<T>,
    ) -> Self {
        let node = Arc::new(TaskNode::new(
            transaction.id,
            Arc::downgrade(&transaction),
            subtask,
        ));
        Self {
            transaction,
            node,
            deps: IndexMap::with_hasher(FxBuildHasher),
            injections: Vec::new(),
            outward: Vec::new(),
            facets,
            released: false,
        }
    }

    /// Id the task will keep once released.
    pub fn id(&self) -> TaskId {
        self.node.id
    }

    /// Id of the transaction the task is released into.
    pub fn transaction_id(&self) -> TransactionId {
        self.transaction.id
    }

    /// Handle to the owning transaction.
    pub fn transaction(&self) -> Transaction {
        Transaction {
            inner: Arc::clone(&self.transaction),
        }
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Make the task wait for `dependency` to execute.
    ///
    /// Adding the same dependency twice has no further effect.
    ///
    /// # Errors
    /// - [`TaskBuilderError::IllegalState`] if the builder was released.
    /// - [`TaskBuilderError::InvalidTransactionScope`] if the dependency
    ///   belongs to a descendant or an unrelated transaction.
    /// - [`TaskBuilderError::Cycle`] if the dependency already waits for
    ///   this task.
    pub fn add_dependency(&mut self, dependency: &TaskHandle) -> Result<&mut Self, TaskBuilderError> {
        self.ensure_open()?;
        self.check_dependency(&dependency.node)?;
        self.insert_dependency(&dependency.node);
        Ok(self)
    }

    /// [`Self::add_dependency`], then write the dependency's result into
    /// `target` right before this task executes.
    ///
    /// If the dependency produces no result, this task fails execution with
    /// [`ValueError::Unset`].
    ///
    /// # Errors
    /// As for [`Self::add_dependency`].
    pub fn add_dependency_into<D>(
        &mut self,
        dependency: &TaskController<D>,
        target: impl WritableValue<D> + 'static,
    ) -> Result<&mut Self, TaskBuilderError>
    where
        D: Clone + Send + Sync + 'static,
    {
        self.ensure_open()?;
        self.check_dependency(&dependency.node)?;
        self.insert_dependency(&dependency.node);
        let source = Arc::clone(&dependency.node);
        self.injections.push(Box::new(move || {
            let value = source
                .result()
                .ok_or(ValueError::Unset)?
                .downcast_ref::<D>()
                .ok_or(ValueError::TypeMismatch {
                    expected: type_name::<D>(),
                })?;
            target.write(value.clone())
        }));
        Ok(self)
    }

    /// Add several dependencies at once. Either all are added or, on error,
    /// none is.
    ///
    /// # Errors
    /// As for [`Self::add_dependency`], for the first offending dependency.
    pub fn add_dependencies<'a>(
        &mut self,
        dependencies: impl IntoIterator<Item = &'a TaskHandle>,
    ) -> Result<&mut Self, TaskBuilderError> {
        self.ensure_open()?;
        let dependencies: Vec<&TaskHandle> = dependencies.into_iter().collect();
        for dependency in &dependencies {
            self.check_dependency(&dependency.node)?;
        }
        for dependency in dependencies {
            self.insert_dependency(&dependency.node);
        }
        Ok(self)
    }

    /// Copy `source` into `target` after every dependency has executed and
    /// before this task's executable runs. Injections apply in the order they
    /// were added.
    ///
    /// # Errors
    /// [`TaskBuilderError::IllegalState`] if the builder was released.
    pub fn add_injection<V: 'static>(
        &mut self,
        source: impl ReadableValue<V> + 'static,
        target: impl WritableValue<V> + 'static,
    ) -> Result<&mut Self, TaskBuilderError> {
        self.ensure_open()?;
        self.injections
            .push(Box::new(move || target.write(source.read()?)));
        Ok(self)
    }

    /// Write this task's result into `target` once it has executed, for
    /// consumers outside the task graph.
    ///
    /// Skipped if the task produces no result. A write failure fails the
    /// task's execution.
    ///
    /// # Errors
    /// [`TaskBuilderError::IllegalState`] if the builder was released.
    pub fn add_outward_injection(
        &mut self,
        target: impl WritableValue<T> + 'static,
    ) -> Result<&mut Self, TaskBuilderError>
    where
        T: Clone,
    {
        self.ensure_open()?;
        self.outward.push(Box::new(move |value: &(dyn Any + Send + Sync)| {
            let value = value.downcast_ref::<T>().ok_or(ValueError::TypeMismatch {
                expected: type_name::<T>(),
            })?;
            target.write(value.clone())
        }));
        Ok(self)
    }

    /// Replace the executable facet. `None` turns the task into a no-op that
    /// still takes part in dependency ordering.
    ///
    /// # Errors
    /// [`TaskBuilderError::IllegalState`] if the builder was released.
    pub fn set_executable(
        &mut self,
        executable: Option<Box<dyn Executable<T>>>,
    ) -> Result<&mut Self, TaskBuilderError> {
        self.ensure_open()?;
        self.facets.executable = executable;
        Ok(self)
    }

    /// # Errors
    /// [`TaskBuilderError::IllegalState`] if the builder was released.
    pub fn set_validatable(
        &mut self,
        validatable: Option<Box<dyn Validatable>>,
    ) -> Result<&mut Self, TaskBuilderError> {
        self.ensure_open()?;
        self.facets.validatable = validatable;
        Ok(self)
    }

    /// # Errors
    /// [`TaskBuilderError::IllegalState`] if the builder was released.
    pub fn set_revertible(
        &mut self,
        revertible: Option<Box<dyn Revertible>>,
    ) -> Result<&mut Self, TaskBuilderError> {
        self.ensure_open()?;
        self.facets.revertible = revertible;
        Ok(self)
    }

    /// # Errors
    /// [`TaskBuilderError::IllegalState`] if the builder was released.
    pub fn set_committable(
        &mut self,
        committable: Option<Box<dyn Committable>>,
    ) -> Result<&mut Self, TaskBuilderError> {
        self.ensure_open()?;
        self.facets.committable = committable;
        Ok(self)
    }

    /// Freeze the configuration and hand the task to its transaction.
    ///
    /// `listener` runs exactly once with the task's execution outcome: on the
    /// thread that produces it, or right away if the task already has one.
    /// The task may start executing before this call returns. Listeners run
    /// on worker threads and must not drive the task's transaction.
    ///
    /// # Errors
    /// - [`TaskBuilderError::IllegalState`] if the builder was released.
    /// - [`TaskBuilderError::TransactionNotActive`] if the transaction has
    ///   left the `Active` phase. The builder stays open.
    pub fn release<L>(&mut self, listener: L) -> Result<TaskController<T>, TaskBuilderError>
    where
        L: FnOnce(&TaskController<T>, &TaskOutcome) + Send + 'static,
    {
        self.ensure_open()?;
        let controller = TaskController::new(Arc::clone(&self.node));
        let deps: Vec<Arc<TaskNode>> = self.deps.values().cloned().collect();
        let transaction = Arc::clone(&self.transaction);
        {
            let mut state = transaction.lock_state();
            if state.phase != TransactionPhase::Active {
                return Err(TaskBuilderError::TransactionNotActive {
                    transaction: transaction.id,
                    phase: state.phase,
                });
            }

            controller.on_complete(listener);
            *lock(&self.node.work) = self.take_work();
            self.node.freeze_deps(deps.clone());
            state.tasks.insert(self.node.id, Arc::clone(&self.node));
            state.unfinished += 1;
            self.node.set_state(TaskState::Released);
        }
        self.released = true;
        debug!(
            task = %self.node.id,
            transaction = %self.transaction.id,
            deps = deps.len(),
            "task released"
        );

        for dep in &deps {
            match dep.register_dependent(&self.node) {
                Registration::Satisfied => {
                    let last = self.node.dependency_resolved();
                    debug_assert!(!last, "TaskBuilder::release: [1]");
                }
                Registration::Failed => {
                    propagate_failure(vec![(Arc::clone(&self.node), dep.id)]);
                    return Ok(controller);
                }
                Registration::Pending => {
                    debug!(task = %self.node.id, dependency = %dep.id, "waiting for dependency");
                }
            }
        }
        if self.node.dependency_resolved() {
            schedule(Arc::clone(&self.node));
        }
        Ok(controller)
    }

    fn ensure_open(&self) -> Result<(), TaskBuilderError> {
        if self.released {
            return Err(TaskBuilderError::IllegalState(self.node.id));
        }
        Ok(())
    }

    fn check_dependency(&self, dependency: &TaskNode) -> Result<(), TaskBuilderError> {
        if !self.transaction.lineage.contains(&dependency.transaction) {
            return Err(TaskBuilderError::InvalidTransactionScope {
                dependency: dependency.id,
                dependency_transaction: dependency.transaction,
                transaction: self.transaction.id,
            });
        }
        if dependency.reaches(self.node.id) {
            return Err(TaskBuilderError::Cycle {
                task: self.node.id,
                dependency: dependency.id,
            });
        }
        Ok(())
    }

    fn insert_dependency(&mut self, dependency: &Arc<TaskNode>) {
        self.deps
            .entry(dependency.id)
            .or_insert_with(|| Arc::clone(dependency));
    }

    fn take_work(&mut self) -> Work {
        let facets = mem::take(&mut self.facets);
        Work {
            executable: facets.executable.map(erase_executable),
            injections: mem::take(&mut self.injections),
            outward: mem::take(&mut self.outward),
            validatable: facets.validatable,
            revertible: facets.revertible,
            committable: facets.committable,
        }
    }
}

fn erase_executable<T: Send + Sync + 'static>(
    mut executable: Box<dyn Executable<T>>,
) -> ErasedExecutable {
    Box::new(move || {
        executable
            .execute()
            .map(|value| Box::new(value) as AnyValue)
    })
}
