mod phase;
mod protocol;

pub use crate::transaction::phase::{TransactionError, TransactionOutcome, TransactionPhase};
use crate::{
    executor::ExecutorShared,
    sync::{Condvar, Mutex, MutexGuard, lock, wait},
    task::{Executable, Facets, TaskBuilder, node::TaskNode},
    types::{IndexMap, TaskId, TransactionId},
};
use core::{any::Any, fmt};
use rustc_hash::FxBuildHasher;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// A scope owning a set of tasks and driving them through the phase
/// protocol.
///
/// Cloning is cheap and yields another handle to the same transaction.
/// Phase-driving operations ([`Self::prepare`], [`Self::commit`],
/// [`Self::rollback`]) are serialized per transaction and block the calling
/// thread. Facets may drive child transactions, but never the transaction
/// their own task belongs to.
#[must_use]
#[derive(Clone)]
pub struct Transaction {
    pub(crate) inner: Arc<TxnInner>,
}

pub(crate) struct TxnInner {
    pub(crate) id: TransactionId,
    /// Ids from the root down to this transaction, inclusive.
    pub(crate) lineage: Vec<TransactionId>,
    parent: Option<Weak<TxnInner>>,
    /// Phase of the parent when this transaction was opened; `Active` for a
    /// root.
    pub(crate) opened_in: TransactionPhase,
    pub(crate) executor: Arc<ExecutorShared>,
    pub(crate) state: Mutex<TxnState>,
    /// Signalled whenever a counter drops or the phase changes.
    pub(crate) changed: Condvar,
    /// Held for the whole of a phase-driving operation.
    driver: Mutex<()>,
}

pub(crate) struct TxnState {
    pub(crate) phase: TransactionPhase,
    /// Task arena. A task's slot is its insertion index.
    pub(crate) tasks: IndexMap<TaskId, Arc<TaskNode>>,
    pub(crate) children: Vec<Arc<TxnInner>>,
    /// Released tasks that have not reached an execution outcome.
    pub(crate) unfinished: usize,
    /// Tasks whose executable facet is running.
    pub(crate) executing: usize,
    /// Tasks that ended in `ExecutionFailed`.
    pub(crate) failed: usize,
}

impl TxnInner {
    fn new(
        executor: Arc<ExecutorShared>,
        parent: Option<&Arc<TxnInner>>,
        opened_in: TransactionPhase,
    ) -> Arc<Self> {
        let id = TransactionId::next();
        let mut lineage = parent.map_or_else(Vec::new, |parent| parent.lineage.clone());
        lineage.push(id);
        Arc::new(Self {
            id,
            lineage,
            parent: parent.map(Arc::downgrade),
            opened_in,
            executor,
            state: Mutex::new(TxnState {
                phase: TransactionPhase::Active,
                tasks: IndexMap::with_hasher(FxBuildHasher),
                children: Vec::new(),
                unfinished: 0,
                executing: 0,
                failed: 0,
            }),
            changed: Condvar::new(),
            driver: Mutex::new(()),
        })
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, TxnState> {
        lock(&self.state)
    }

    pub(crate) fn phase(&self) -> TransactionPhase {
        self.lock_state().phase
    }

    /// Change the phase. The caller holds `state`.
    pub(crate) fn set_phase(&self, state: &mut TxnState, phase: TransactionPhase) {
        info!(transaction = %self.id, from = ?state.phase, to = ?phase, "transaction phase");
        state.phase = phase;
        self.changed.notify_all();
    }

    /// Account for a task that reached its execution outcome.
    pub(crate) fn task_finished(&self, was_executing: bool, failed: bool) {
        let mut state = self.lock_state();
        state.unfinished -= 1;
        if was_executing {
            state.executing -= 1;
        }
        if failed {
            state.failed += 1;
        }
        self.changed.notify_all();
    }

    /// Block until `done` holds for the state, and return the guard.
    ///
    /// On one of the executor's workers the wait runs pending pool jobs
    /// instead of parking, since the tasks it waits for may need that very
    /// thread.
    pub(crate) fn wait_until<'a>(
        &'a self,
        mut state: MutexGuard<'a, TxnState>,
        done: impl Fn(&TxnState) -> bool,
    ) -> MutexGuard<'a, TxnState> {
        if !self.executor.on_worker() {
            while !done(&state) {
                state = wait(&self.changed, state);
            }
            return state;
        }
        while !done(&state) {
            drop(state);
            self.executor.help();
            state = self.lock_state();
        }
        state
    }

    pub(crate) fn wait_terminal(&self) -> TransactionPhase {
        let state = self.wait_until(self.lock_state(), |state| state.phase.is_terminal());
        state.phase
    }

    /// Wait until no released task is unfinished and every child opened
    /// while this transaction was in `phase` is terminal.
    pub(crate) fn quiesce<'a>(
        &'a self,
        mut state: MutexGuard<'a, TxnState>,
        phase: TransactionPhase,
    ) -> MutexGuard<'a, TxnState> {
        loop {
            state = self.wait_until(state, |state| state.unfinished == 0);
            let open: Vec<Arc<TxnInner>> = state
                .children
                .iter()
                .filter(|child| child.opened_in == phase && !child.phase().is_terminal())
                .cloned()
                .collect();
            if open.is_empty() {
                return state;
            }
            drop(state);
            for child in &open {
                child.wait_terminal();
            }
            state = self.lock_state();
        }
    }

    fn invalid_phase(&self, operation: &'static str, phase: TransactionPhase) -> TransactionError {
        TransactionError::InvalidPhase {
            transaction: self.id,
            operation,
            phase,
        }
    }
}

impl Transaction {
    pub(crate) fn root(executor: Arc<ExecutorShared>) -> Self {
        let inner = TxnInner::new(executor, None, TransactionPhase::Active);
        debug!(transaction = %inner.id, "root transaction opened");
        Self { inner }
    }

    pub fn id(&self) -> TransactionId {
        self.inner.id
    }

    /// Id of the parent transaction, `None` for a root.
    #[must_use]
    pub fn parent_id(&self) -> Option<TransactionId> {
        self.inner.lineage.iter().rev().nth(1).copied()
    }

    /// Handle to the parent transaction, while it is alive.
    #[must_use]
    pub fn parent(&self) -> Option<Transaction> {
        let inner = self.inner.parent.as_ref()?.upgrade()?;
        Some(Self { inner })
    }

    pub fn phase(&self) -> TransactionPhase {
        self.inner.phase()
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.phase().is_terminal()
    }

    /// Whether `self` is `other` or one of its ancestors.
    #[must_use]
    pub fn is_ancestor_of(&self, other: &Transaction) -> bool {
        other.inner.lineage.contains(&self.inner.id)
    }

    /// Number of tasks released into this transaction.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.inner.lock_state().tasks.len()
    }

    /// Block until the transaction is committed or rolled back, and return
    /// that phase.
    pub fn wait_terminal(&self) -> TransactionPhase {
        self.inner.wait_terminal()
    }

    /// Open a nested transaction.
    ///
    /// The child runs its own phase protocol, but this transaction cannot
    /// leave the phase it is in now until the child is terminal. Children
    /// can be opened from facets, e.g. an executable that runs a nested
    /// transaction to completion.
    ///
    /// # Errors
    /// [`TransactionError::InvalidPhase`] if this transaction is already
    /// committed or rolled back.
    pub fn new_child(&self) -> Result<Transaction, TransactionError> {
        let mut state = self.inner.lock_state();
        if state.phase.is_terminal() {
            return Err(self.inner.invalid_phase("open a child of", state.phase));
        }
        let child = TxnInner::new(
            Arc::clone(&self.inner.executor),
            Some(&self.inner),
            state.phase,
        );
        state.children.push(Arc::clone(&child));
        debug!(
            transaction = %child.id,
            parent = %self.inner.id,
            opened_in = ?state.phase,
            "child transaction opened"
        );
        Ok(Self { inner: child })
    }

    /// Start building a task whose only facet is `executable`.
    pub fn new_task<T, E>(&self, executable: E) -> TaskBuilder<T>
    where
        T: Send + Sync + 'static,
        E: Executable<T> + 'static,
    {
        self.build_task((), Facets::new().executable(executable))
    }

    /// Start building a task around `subtask`, with whichever facets it
    /// provides.
    ///
    /// The subtask object stays reachable through
    /// [`crate::task::TaskHandle::subtask`].
    pub fn build_task<T, S>(&self, subtask: S, facets: Facets<T>) -> TaskBuilder<T>
    where
        T: Send + Sync + 'static,
        S: Any + Send + Sync,
    {
        let subtask: Arc<dyn Any + Send + Sync> = Arc::new(subtask);
        TaskBuilder::new(Arc::clone(&self.inner), subtask, facets)
    }

    /// Wait for every released task and every child transaction to finish,
    /// then validate.
    ///
    /// Returns [`TransactionOutcome::Prepared`] when every task executed and
    /// validated, after which [`Self::commit`] finalizes the transaction.
    /// If any task failed, the transaction is rolled back and
    /// [`TransactionOutcome::RolledBack`] is returned.
    ///
    /// Blocks until every child opened while `Active` is terminal; somebody
    /// else must drive them. Called from a facet, the wait keeps running
    /// pool jobs on the calling worker.
    ///
    /// # Errors
    /// - [`TransactionError::InvalidPhase`] unless the transaction is
    ///   `Active`.
    /// - [`TransactionError::RevertFailed`] if the rollback that follows a
    ///   failure could not undo a task.
    pub fn prepare(&self) -> Result<TransactionOutcome, TransactionError> {
        let _driver = lock(&self.inner.driver);
        self.inner.prepare()
    }

    /// Commit the transaction, preparing it first if it is still `Active`.
    ///
    /// Committable facets run in dependency order. Children opened while
    /// `Prepared` or `Committing` are waited for, like in [`Self::prepare`].
    ///
    /// # Errors
    /// - [`TransactionError::InvalidPhase`] unless the transaction is
    ///   `Active` or `Prepared`.
    /// - [`TransactionError::CommitFailed`] if a committable facet failed;
    ///   the transaction is still `Committed`, with the remaining tasks left
    ///   in their previous state.
    /// - [`TransactionError::RevertFailed`] as for [`Self::prepare`].
    pub fn commit(&self) -> Result<TransactionOutcome, TransactionError> {
        let _driver = lock(&self.inner.driver);
        match self.inner.phase() {
            TransactionPhase::Active => match self.inner.prepare()? {
                TransactionOutcome::Prepared => self.inner.commit(),
                outcome => Ok(outcome),
            },
            TransactionPhase::Prepared => self.inner.commit(),
            phase => Err(self.inner.invalid_phase("commit", phase)),
        }
    }

    /// Abandon the transaction.
    ///
    /// Tasks still waiting for dependencies are cancelled, running
    /// executables are allowed to finish, open children are rolled back, and
    /// every executed task is reverted in reverse dependency order.
    ///
    /// # Errors
    /// - [`TransactionError::InvalidPhase`] unless the transaction is
    ///   `Active` or `Prepared`.
    /// - [`TransactionError::RevertFailed`] if a revertible facet failed, in
    ///   this transaction or in one of its children.
    pub fn rollback(&self) -> Result<(), TransactionError> {
        let _driver = lock(&self.inner.driver);
        self.inner.rollback()
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock_state();
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("lineage", &self.inner.lineage)
            .field("phase", &state.phase)
            .field("tasks", &state.tasks.len())
            .field("children", &state.children.len())
            .finish()
    }
}
