use crate::{
    task::{
        TaskFailure, TaskOutcome, TaskState,
        node::{AnyValue, ExecutionWork, TaskNode},
    },
    transaction::{TransactionPhase, TxnInner},
    types::TaskId,
    utils::panic_message,
};
use core::panic::AssertUnwindSafe;
use std::{panic, sync::Arc};
use tracing::{debug, trace, warn};

/// Call a facet, turning a panic into [`TaskFailure::Panicked`].
pub(crate) fn call_facet<R>(facet: impl FnOnce() -> Result<R, TaskFailure>) -> Result<R, TaskFailure> {
    panic::catch_unwind(AssertUnwindSafe(facet))
        .unwrap_or_else(|payload| Err(TaskFailure::Panicked(panic_message(&*payload).into())))
}

/// Hand a ready task to its transaction's worker pool.
pub(crate) fn schedule(node: Arc<TaskNode>) {
    let Some(txn) = node.owner.upgrade() else {
        trace!(task = %node.id, "transaction dropped; task not scheduled");
        return;
    };
    debug!(task = %node.id, transaction = %txn.id, "task ready");
    let executor = Arc::clone(&txn.executor);
    executor.pool.spawn(move || run_task(&txn, &node));
}

/// Worker job: claim the task, apply its injections, run its executable and
/// publish the outcome.
fn run_task(txn: &Arc<TxnInner>, node: &Arc<TaskNode>) {
    {
        let mut state = txn.lock_state();
        if state.phase != TransactionPhase::Active {
            drop(state);
            // Same-transaction dependents are cancelled by the rollback that
            // moved the phase.
            let orphans = cancel(txn, node)
                .into_iter()
                .filter(|orphan| orphan.transaction != txn.id)
                .map(|orphan| (orphan, node.id))
                .collect();
            propagate_failure(orphans);
            return;
        }
        if !node.transition(TaskState::Released, TaskState::Executing) {
            return;
        }
        state.executing += 1;
    }

    let executed = execute(node);
    let failure = match executed {
        Ok(Some(value)) => {
            node.store_result(value);
            None
        }
        Ok(None) => None,
        Err(failure) => Some(failure),
    };
    let to = if failure.is_some() {
        TaskState::ExecutionFailed
    } else {
        TaskState::Executed
    };
    let dependents = node
        .settle(TaskState::Executing, to, failure.clone())
        .expect("run_task: [1]");

    let outcome = match failure {
        None => TaskOutcome::Executed,
        Some(failure) => {
            warn!(task = %node.id, transaction = %txn.id, %failure, "task execution failed");
            TaskOutcome::ExecutionFailed(failure)
        }
    };
    let succeeded = outcome.is_executed();
    node.completion.complete(outcome);
    txn.task_finished(true, !succeeded);

    if succeeded {
        for dependent in dependents {
            if dependent.dependency_resolved() {
                schedule(dependent);
            }
        }
    } else {
        propagate_failure(dependents.into_iter().map(|dependent| (dependent, node.id)).collect());
    }
}

fn execute(node: &TaskNode) -> Result<Option<AnyValue>, TaskFailure> {
    let ExecutionWork {
        executable,
        injections,
        outward,
    } = node.take_execution_work();
    call_facet(move || {
        for inject in injections {
            inject()?;
        }
        let Some(mut executable) = executable else {
            return Ok(None);
        };
        let value = executable()?;
        for write in outward {
            write(&*value)?;
        }
        Ok(Some(value))
    })
}

/// Move a task that never started out of `Released` for good. Returns the
/// dependents that were waiting on it, empty if the task had already moved
/// on.
pub(crate) fn cancel(txn: &TxnInner, node: &TaskNode) -> Vec<Arc<TaskNode>> {
    let Some(orphans) = node.settle(TaskState::Released, TaskState::RolledBack, None) else {
        return Vec::new();
    };
    debug!(task = %node.id, transaction = %txn.id, "task cancelled");
    node.completion.complete(TaskOutcome::RolledBack);
    txn.task_finished(false, false);
    orphans
}

/// Fail every waiting task in `pending`, and transitively their own
/// dependents, because the paired dependency will never execute.
pub(crate) fn propagate_failure(mut pending: Vec<(Arc<TaskNode>, TaskId)>) {
    while let Some((node, cause)) = pending.pop() {
        let failure = TaskFailure::DependencyFailed(cause);
        let Some(orphans) =
            node.settle(TaskState::Released, TaskState::ExecutionFailed, Some(failure.clone()))
        else {
            continue;
        };
        warn!(task = %node.id, dependency = %cause, "dependency failed; task will not execute");
        node.completion.complete(TaskOutcome::ExecutionFailed(failure));
        if let Some(owner) = node.owner.upgrade() {
            owner.task_finished(false, true);
        }
        pending.extend(orphans.into_iter().map(|orphan| (orphan, node.id)));
    }
}
