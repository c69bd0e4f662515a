//! Value slots: the read and write capabilities injections are expressed in.
//!
//! The engine only relies on [`ReadableValue`] and [`WritableValue`];
//! [`InjectedValue`] and [`ImmediateValue`] are the stock implementations.
//! Closures returning `Result<_, ValueError>` implement the traits too, which
//! is convenient for computed sources and forwarding targets.

use std::{
    fmt,
    sync::{Arc, OnceLock},
};
use thiserror::Error;

/// Error raised when reading from or writing to a value slot fails.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValueError {
    /// The slot was read before anything was written to it.
    #[error("value has not been set")]
    Unset,
    /// The slot only accepts a single assignment and was already written.
    #[error("value has already been set")]
    AlreadySet,
    /// A type-erased value did not have the expected type.
    #[error("value is not a `{expected}`")]
    TypeMismatch {
        /// Name of the type the reader asked for.
        expected: &'static str,
    },
}

/// Read side of a value slot.
pub trait ReadableValue<T>: Send + Sync {
    /// Read the current value.
    ///
    /// # Errors
    /// If no value is available.
    fn read(&self) -> Result<T, ValueError>;
}

/// Write side of a value slot.
pub trait WritableValue<T>: Send + Sync {
    /// Store `value` into the slot.
    ///
    /// # Errors
    /// If the slot refuses the value, e.g. because it was already written.
    fn write(&self, value: T) -> Result<(), ValueError>;
}

impl<T, F> ReadableValue<T> for F
where
    F: Fn() -> Result<T, ValueError> + Send + Sync,
{
    fn read(&self) -> Result<T, ValueError> {
        self()
    }
}

impl<T, F> WritableValue<T> for F
where
    F: Fn(T) -> Result<(), ValueError> + Send + Sync,
{
    fn write(&self, value: T) -> Result<(), ValueError> {
        self(value)
    }
}

/// Single-assignment slot shared between a writer and its readers.
///
/// Clones share the same underlying cell, so a clone handed to a builder as
/// an injection target can later be read through the original.
pub struct InjectedValue<T> {
    cell: Arc<OnceLock<T>>,
}

impl<T> InjectedValue<T> {
    /// Empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cell: Arc::new(OnceLock::new()),
        }
    }

    /// Whether a value has been written.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Borrow the stored value, if any.
    #[must_use]
    pub fn get_ref(&self) -> Option<&T> {
        self.cell.get()
    }
}

impl<T: Clone> InjectedValue<T> {
    /// Clone of the stored value, if any.
    #[must_use]
    pub fn get(&self) -> Option<T> {
        self.cell.get().cloned()
    }
}

impl<T> Clone for InjectedValue<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> Default for InjectedValue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for InjectedValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InjectedValue")
            .field("set", &self.is_set())
            .finish()
    }
}

impl<T: Clone + Send + Sync> ReadableValue<T> for InjectedValue<T> {
    fn read(&self) -> Result<T, ValueError> {
        self.get().ok_or(ValueError::Unset)
    }
}

impl<T: Send + Sync> WritableValue<T> for InjectedValue<T> {
    fn write(&self, value: T) -> Result<(), ValueError> {
        self.cell.set(value).map_err(|_| ValueError::AlreadySet)
    }
}

/// Readable constant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImmediateValue<T>(pub T);

impl<T: Clone + Send + Sync> ReadableValue<T> for ImmediateValue<T> {
    fn read(&self) -> Result<T, ValueError> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injected_value_is_single_assignment() {
        let slot = InjectedValue::<u32>::new();
        assert_eq!(slot.read(), Err(ValueError::Unset));

        let writer = slot.clone();
        writer.write(7).unwrap();
        assert_eq!(writer.write(8), Err(ValueError::AlreadySet));

        assert!(slot.is_set());
        assert_eq!(slot.get(), Some(7));
        assert_eq!(slot.read(), Ok(7));
    }

    #[test]
    fn closures_act_as_slots() {
        let target = InjectedValue::<String>::new();
        let forward = {
            let target = target.clone();
            move |value: String| target.write(value.to_uppercase())
        };
        let source = || Ok::<_, ValueError>(String::from("abc"));

        forward.write(source.read().unwrap()).unwrap();
        assert_eq!(target.get().as_deref(), Some("ABC"));
        assert_eq!(ImmediateValue(3).read(), Ok(3));
    }
}
