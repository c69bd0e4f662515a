use crate::{
    task::TaskFailure,
    types::{TaskId, TransactionId},
};
use thiserror::Error;

/// Aggregate phase of a transaction.
///
/// `Active -> Validating -> Prepared -> Committing -> Committed`, with
/// `RollingBack -> RolledBack` reachable from `Active`, `Validating` and
/// `Prepared`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TransactionPhase {
    /// Tasks are being added and executed.
    Active,
    /// Execution is over; validatable facets are running.
    Validating,
    /// Every task validated; waiting for `commit`.
    Prepared,
    /// Committable facets are running.
    Committing,
    /// Terminal success.
    Committed,
    /// Revertible facets are running.
    RollingBack,
    /// Terminal failure.
    RolledBack,
}

impl TransactionPhase {
    /// Whether the phase is `Committed` or `RolledBack`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

/// Result of asking a transaction to advance.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[must_use]
pub enum TransactionOutcome {
    /// Validation succeeded; the transaction waits for `commit`.
    Prepared,
    /// Every committable facet ran.
    Committed,
    /// A task failed execution or validation and the transaction was rolled
    /// back.
    RolledBack,
}

/// Error returned by the operations that drive a transaction's phases.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum TransactionError {
    /// The operation is not allowed in the transaction's current phase.
    #[error("cannot {operation} transaction {transaction} in phase {phase:?}")]
    InvalidPhase {
        transaction: TransactionId,
        operation: &'static str,
        phase: TransactionPhase,
    },
    /// A revertible facet failed; the rollback stopped part-way.
    #[error("revert of {task} failed: {failure}")]
    RevertFailed {
        task: TaskId,
        #[source]
        failure: TaskFailure,
    },
    /// A committable facet failed; the commit stopped part-way.
    #[error("commit of {task} failed: {failure}")]
    CommitFailed {
        task: TaskId,
        #[source]
        failure: TaskFailure,
    },
}
