use core::sync::atomic::{AtomicU64, Ordering};
use derive_more::Display;
use indexmap::IndexMap as _IndexMap;
use rustc_hash::FxBuildHasher;
use std::collections::{HashMap as _HashMap, HashSet as _HashSet};

/// Process-unique identifier of a task.
///
/// Assigned when the task's builder is created and stable for the lifetime
/// of the task, including after it has been released into its transaction.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("task#{_0}")]
#[repr(transparent)]
pub struct TaskId(u64);

/// Process-unique identifier of a transaction.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("txn#{_0}")]
#[repr(transparent)]
pub struct TransactionId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    pub(crate) fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value of the identifier.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl TransactionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value of the identifier.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

pub(crate) type HashMap<K, V> = _HashMap<K, V, FxBuildHasher>;
pub(crate) type HashSet<T> = _HashSet<T, FxBuildHasher>;
/// `IndexMap` type with fast hasher.
pub type IndexMap<K, V> = _IndexMap<K, V, FxBuildHasher>;
