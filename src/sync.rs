#[cfg(feature = "loom")]
mod imp {
    pub(crate) use loom::sync::{Condvar, Mutex, MutexGuard};
}

#[cfg(not(feature = "loom"))]
mod imp {
    pub(crate) use std::sync::{Condvar, Mutex, MutexGuard};
}

pub(crate) use imp::*;
use std::sync::PoisonError;

/// Acquire `mutex`, recovering the guard if a previous holder panicked.
///
/// Engine locks are never held across user facet calls, so a poisoned lock
/// can only come from a panic inside the engine's own short critical
/// sections, which leave the protected data consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Block on `condvar`, recovering the guard on poisoning like [`lock`].
pub(crate) fn wait<'a, T>(condvar: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    condvar.wait(guard).unwrap_or_else(PoisonError::into_inner)
}
