mod builder;
mod controller;
mod facet;
pub(crate) mod node;

pub use crate::task::{
    builder::{TaskBuilder, TaskBuilderError},
    controller::{TaskController, TaskHandle},
    facet::{Committable, Executable, Facets, Revertible, Validatable},
};
use crate::{types::TaskId, value::ValueError};
use std::sync::Arc;
use thiserror::Error;

/// Lifecycle state of a single task.
///
/// ```text
/// Created -> Released -> Executing -> Executed -> Validating -> Validated -> Committing -> Committed
///                            |                        |
///                            v                        v
///                     ExecutionFailed          ValidationFailed
///                            \________________________/
///                                        v
///                            RollingBack -> RolledBack
/// ```
///
/// Tasks without an executable facet go from `Released` straight to
/// `Executed` once ready. Tasks still waiting for dependencies when their
/// transaction rolls back go from `Released` straight to `RolledBack`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaskState {
    /// The builder is still open.
    Created = 0,
    /// Released into its transaction; waiting for dependencies.
    Released = 1,
    /// Injections and the executable facet are running.
    Executing = 2,
    /// Executed successfully; the result is available to dependents.
    Executed = 3,
    /// The executable facet, an injection or a dependency failed.
    ExecutionFailed = 4,
    /// The validatable facet is running.
    Validating = 5,
    /// Validated; waiting for commit.
    Validated = 6,
    /// The validatable facet rejected the task.
    ValidationFailed = 7,
    /// The committable facet is running.
    Committing = 8,
    /// Terminal success.
    Committed = 9,
    /// The revertible facet is running.
    RollingBack = 10,
    /// Terminal failure.
    RolledBack = 11,
}

impl TaskState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Created,
            1 => Self::Released,
            2 => Self::Executing,
            3 => Self::Executed,
            4 => Self::ExecutionFailed,
            5 => Self::Validating,
            6 => Self::Validated,
            7 => Self::ValidationFailed,
            8 => Self::Committing,
            9 => Self::Committed,
            10 => Self::RollingBack,
            11 => Self::RolledBack,
            _ => unreachable!("TaskState::from_u8: [{raw}]"),
        }
    }

    /// Whether the executable facet completed successfully at some point,
    /// i.e. the task has forward effects that a rollback must undo.
    #[must_use]
    pub fn has_executed(self) -> bool {
        matches!(
            self,
            Self::Executed
                | Self::Validating
                | Self::Validated
                | Self::ValidationFailed
                | Self::Committing
                | Self::Committed
        )
    }

    /// Whether the task failed execution or validation.
    #[must_use]
    pub fn is_failed(self) -> bool {
        matches!(self, Self::ExecutionFailed | Self::ValidationFailed)
    }

    /// Whether the task has reached `Committed` or `RolledBack`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

/// Why a task failed.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum TaskFailure {
    /// A facet returned an error.
    #[error("{0:#}")]
    Facet(Arc<anyhow::Error>),
    /// A facet panicked.
    #[error("facet panicked: {0}")]
    Panicked(Arc<str>),
    /// A dependency failed or was cancelled, so the task never ran.
    #[error("dependency {0} did not execute successfully")]
    DependencyFailed(TaskId),
    /// An injection into or out of the task could not be delivered.
    #[error("injection failed: {0}")]
    Injection(#[from] ValueError),
}

impl From<anyhow::Error> for TaskFailure {
    fn from(error: anyhow::Error) -> Self {
        Self::Facet(Arc::new(error))
    }
}

/// Per-task outcome delivered to completion listeners.
///
/// Reported once, when the task stops being a candidate for execution.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// The task executed; its result, if any, is on the controller.
    Executed,
    /// The task did not execute successfully.
    ExecutionFailed(TaskFailure),
    /// The owning transaction rolled back before the task could run.
    RolledBack,
}

impl TaskOutcome {
    /// Whether the task executed successfully.
    #[must_use]
    pub fn is_executed(&self) -> bool {
        matches!(self, Self::Executed)
    }

    /// The failure, for `ExecutionFailed` outcomes.
    #[must_use]
    pub fn failure(&self) -> Option<&TaskFailure> {
        match self {
            Self::ExecutionFailed(failure) => Some(failure),
            Self::Executed | Self::RolledBack => None,
        }
    }
}
