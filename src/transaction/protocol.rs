//! Phase transitions of a single transaction.
//!
//! Every function here runs with the transaction's driver lock held, so at
//! most one of them is in progress per transaction. Locks are always taken
//! parent before child. A transaction's state lock is never held together
//! with a task's dependents lock.
//!
//! A transaction leaves a phase only once every child opened during that
//! phase is terminal. Rollback is the exception: it rolls open children
//! back itself.

use crate::{
    executor::execute::{cancel, propagate_failure},
    sync::lock,
    task::{TaskState, node::TaskNode},
    transaction::{TransactionError, TransactionOutcome, TransactionPhase, TxnInner},
};
use std::sync::Arc;
use tracing::{error, warn};

impl TxnInner {
    pub(super) fn prepare(&self) -> Result<TransactionOutcome, TransactionError> {
        let state = self.lock_state();
        if state.phase != TransactionPhase::Active {
            return Err(self.invalid_phase("prepare", state.phase));
        }
        let mut state = self.quiesce(state, TransactionPhase::Active);

        if state.failed > 0 {
            warn!(transaction = %self.id, failed = state.failed, "tasks failed to execute");
            drop(state);
            return self
                .rollback_from(TransactionPhase::Active)
                .map(|()| TransactionOutcome::RolledBack);
        }
        self.set_phase(&mut state, TransactionPhase::Validating);
        let executed: Vec<Arc<TaskNode>> = state
            .tasks
            .values()
            .filter(|node| node.state() == TaskState::Executed)
            .cloned()
            .collect();
        drop(state);

        let rejected = self.executor.validate(&executed);
        if rejected > 0 {
            warn!(transaction = %self.id, rejected, "validation failed");
            return self
                .rollback_from(TransactionPhase::Validating)
                .map(|()| TransactionOutcome::RolledBack);
        }
        let mut state = self.quiesce(self.lock_state(), TransactionPhase::Validating);
        self.set_phase(&mut state, TransactionPhase::Prepared);
        Ok(TransactionOutcome::Prepared)
    }

    pub(super) fn commit(&self) -> Result<TransactionOutcome, TransactionError> {
        let validated: Vec<Arc<TaskNode>> = {
            let mut state = self.quiesce(self.lock_state(), TransactionPhase::Prepared);
            self.set_phase(&mut state, TransactionPhase::Committing);
            state.tasks.values().cloned().collect()
        };

        let committed = self.executor.commit(&validated);

        let mut state = self.quiesce(self.lock_state(), TransactionPhase::Committing);
        self.set_phase(&mut state, TransactionPhase::Committed);
        match committed {
            Ok(()) => Ok(TransactionOutcome::Committed),
            Err((task, failure)) => {
                error!(transaction = %self.id, task = %task, %failure, "commit stopped");
                Err(TransactionError::CommitFailed { task, failure })
            }
        }
    }

    pub(super) fn rollback(&self) -> Result<(), TransactionError> {
        let phase = self.phase();
        match phase {
            TransactionPhase::Active | TransactionPhase::Prepared => self.rollback_from(phase),
            phase => Err(self.invalid_phase("roll back", phase)),
        }
    }

    /// Cancel waiting tasks, roll back open children, then revert every task
    /// that executed, dependents before their dependencies.
    fn rollback_from(&self, phase: TransactionPhase) -> Result<(), TransactionError> {
        let mut state = self.lock_state();
        debug_assert_eq!(state.phase, phase, "TxnInner::rollback_from: [1]");
        self.set_phase(&mut state, TransactionPhase::RollingBack);
        let state = self.wait_until(state, |state| state.executing == 0);
        let tasks: Vec<Arc<TaskNode>> = state.tasks.values().cloned().collect();
        let children = state.children.clone();
        drop(state);

        // Cancel first, so children waiting on these tasks can finish.
        let mut orphans = Vec::new();
        for node in &tasks {
            if node.state() == TaskState::Released {
                orphans.extend(cancel(self, node).into_iter().map(|orphan| (orphan, node.id)));
            }
        }
        propagate_failure(orphans);

        let mut first_error = None;
        for child in children {
            match child.rollback_open() {
                Ok(()) | Err(TransactionError::InvalidPhase { .. }) => {}
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        let mut executed = Vec::new();
        for node in tasks {
            match node.state() {
                TaskState::ExecutionFailed => node.set_state(TaskState::RolledBack),
                state if state.has_executed() => executed.push(node),
                _ => {}
            }
        }
        let reverted = self.executor.revert(&executed);

        let mut state = self.quiesce(self.lock_state(), TransactionPhase::RollingBack);
        self.set_phase(&mut state, TransactionPhase::RolledBack);
        drop(state);
        if let Err((task, failure)) = reverted {
            error!(transaction = %self.id, task = %task, %failure, "rollback stopped");
            return Err(TransactionError::RevertFailed { task, failure });
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Roll back a child on behalf of its parent, waiting for any driver
    /// already working on it.
    fn rollback_open(&self) -> Result<(), TransactionError> {
        let _driver = lock(&self.driver);
        self.rollback()
    }
}
