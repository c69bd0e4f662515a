use crate::sync::{Condvar, Mutex, lock, wait};
use core::{fmt, mem};

type Callback<V> = Box<dyn FnOnce(&V) + Send>;

enum State<V> {
    Pending(Vec<Callback<V>>),
    Complete(V),
}

/// A one-shot completion signal.
///
/// The signal resolves at most once. Callbacks registered before resolution
/// are queued and run by the thread that resolves it; callbacks registered
/// afterwards run immediately on the registering thread. Either way each
/// callback runs exactly once, and there is no window in which a callback
/// registered concurrently with resolution is dropped.
pub struct Completion<V> {
    state: Mutex<State<V>>,
    resolved: Condvar,
}

impl<V: Clone> Completion<V> {
    /// Unresolved signal.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Pending(Vec::new())),
            resolved: Condvar::new(),
        }
    }

    /// Resolve the signal with `value` and run all queued callbacks.
    ///
    /// Returns `false`, leaving the signal untouched, if it was already
    /// resolved.
    pub fn complete(&self, value: V) -> bool {
        let callbacks = {
            let mut state = lock(&self.state);
            let callbacks = match &mut *state {
                State::Complete(_) => return false,
                State::Pending(callbacks) => mem::take(callbacks),
            };
            *state = State::Complete(value.clone());
            callbacks
        };
        self.resolved.notify_all();
        for callback in callbacks {
            callback(&value);
        }
        true
    }

    /// Run `callback` with the resolved value, now if already resolved or
    /// later on the resolving thread otherwise.
    pub fn on_complete(&self, callback: impl FnOnce(&V) + Send + 'static) {
        let value = {
            let mut state = lock(&self.state);
            match &mut *state {
                State::Pending(callbacks) => {
                    callbacks.push(Box::new(callback));
                    return;
                }
                State::Complete(value) => value.clone(),
            }
        };
        callback(&value);
    }

    /// The resolved value, without blocking.
    pub fn get(&self) -> Option<V> {
        match &*lock(&self.state) {
            State::Complete(value) => Some(value.clone()),
            State::Pending(_) => None,
        }
    }

    /// Whether the signal has been resolved.
    pub fn is_complete(&self) -> bool {
        matches!(&*lock(&self.state), State::Complete(_))
    }

    /// Block the calling thread until the signal resolves.
    pub fn wait(&self) -> V {
        let mut state = lock(&self.state);
        loop {
            if let State::Complete(value) = &*state {
                return value.clone();
            }
            state = wait(&self.resolved, state);
        }
    }
}

impl<V: Clone> Default for Completion<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: fmt::Debug> fmt::Debug for Completion<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*lock(&self.state) {
            State::Complete(value) => f.debug_tuple("Completion").field(value).finish(),
            State::Pending(callbacks) => f
                .debug_struct("Completion")
                .field("pending_callbacks", &callbacks.len())
                .finish(),
        }
    }
}
