use core::fmt;

/// The forward action of a task.
///
/// Runs once, on a worker thread, after every dependency has executed and
/// every injection has been applied. The returned value becomes the task's
/// result and is visible to dependents.
pub trait Executable<T>: Send {
    /// Perform the forward action.
    ///
    /// # Errors
    /// Any error marks the task `ExecutionFailed` and makes the owning
    /// transaction roll back when it is prepared.
    fn execute(&mut self) -> anyhow::Result<T>;
}

/// Post-condition check run during the validation phase.
pub trait Validatable: Send {
    /// Check the task's post-conditions.
    ///
    /// # Errors
    /// Any error rejects the task and forces the transaction to roll back.
    fn validate(&mut self) -> anyhow::Result<()>;
}

/// Undo of the forward action, run during rollback.
pub trait Revertible: Send {
    /// Undo the task's forward effects.
    ///
    /// # Errors
    /// A failure is fatal for the rollback and is reported to whoever drives
    /// the transaction.
    fn revert(&mut self) -> anyhow::Result<()>;
}

/// Finalization that is only safe once the whole transaction succeeded.
pub trait Committable: Send {
    /// Finalize the task's effects.
    ///
    /// # Errors
    /// A failure is fatal for the commit and is reported to whoever drives
    /// the transaction.
    fn commit(&mut self) -> anyhow::Result<()>;
}

impl<T, F> Executable<T> for F
where
    F: FnMut() -> anyhow::Result<T> + Send,
{
    fn execute(&mut self) -> anyhow::Result<T> {
        self()
    }
}

impl<F> Validatable for F
where
    F: FnMut() -> anyhow::Result<()> + Send,
{
    fn validate(&mut self) -> anyhow::Result<()> {
        self()
    }
}

impl<F> Revertible for F
where
    F: FnMut() -> anyhow::Result<()> + Send,
{
    fn revert(&mut self) -> anyhow::Result<()> {
        self()
    }
}

impl<F> Committable for F
where
    F: FnMut() -> anyhow::Result<()> + Send,
{
    fn commit(&mut self) -> anyhow::Result<()> {
        self()
    }
}

/// The capability set of a task: each facet is independently optional.
///
/// Passed together with the subtask object when a task is created; any facet
/// can still be replaced or cleared on the builder before release.
#[must_use]
pub struct Facets<T> {
    pub(crate) executable: Option<Box<dyn Executable<T>>>,
    pub(crate) validatable: Option<Box<dyn Validatable>>,
    pub(crate) revertible: Option<Box<dyn Revertible>>,
    pub(crate) committable: Option<Box<dyn Committable>>,
}

impl<T> Facets<T> {
    /// No facets at all: the task is a no-op that still takes part in
    /// dependency ordering.
    pub fn new() -> Self {
        Self {
            executable: None,
            validatable: None,
            revertible: None,
            committable: None,
        }
    }

    pub fn executable(mut self, executable: impl Executable<T> + 'static) -> Self {
        self.executable = Some(Box::new(executable));
        self
    }

    pub fn validatable(mut self, validatable: impl Validatable + 'static) -> Self {
        self.validatable = Some(Box::new(validatable));
        self
    }

    pub fn revertible(mut self, revertible: impl Revertible + 'static) -> Self {
        self.revertible = Some(Box::new(revertible));
        self
    }

    pub fn committable(mut self, committable: impl Committable + 'static) -> Self {
        self.committable = Some(Box::new(committable));
        self
    }
}

impl<T> Default for Facets<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Facets<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Facets")
            .field("executable", &self.executable.is_some())
            .field("validatable", &self.validatable.is_some())
            .field("revertible", &self.revertible.is_some())
            .field("committable", &self.committable.is_some())
            .finish()
    }
}
