use crate::{
    sync::{Mutex, lock},
    task::{TaskFailure, node::TaskNode},
    types::{HashMap, TaskId},
    utils::RangeSplitAtHalf,
};
use core::{
    ops::Range,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};
use rayon::{Scope, ThreadPool};
use rustc_hash::FxBuildHasher;
use std::sync::Arc;

/// Which end of a dependency edge has to finish first.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(super) enum Direction {
    /// Dependencies before dependents (commit).
    Forward,
    /// Dependents before dependencies (revert).
    Reverse,
}

/// Run `step` on every node of `range`, splitting the range in half until
/// single nodes remain. Returns how many steps reported `false`.
pub(super) fn join_unordered<F>(nodes: &[Arc<TaskNode>], range: Range<usize>, step: &F) -> usize
where
    F: Fn(&TaskNode) -> bool + Sync,
{
    match range.len() {
        0 => return 0,
        1 => return usize::from(!step(&nodes[range.start])),
        _ => {}
    }
    let (left_range, right_range) = range.split_at_half();
    let (left, right) = rayon::join(
        || join_unordered(nodes, left_range, step),
        || join_unordered(nodes, right_range, step),
    );
    left + right
}

/// A dependency-ordered pass over the tasks of one transaction.
///
/// Only edges between the given nodes count, so the order holds within one
/// transaction. Across transactions the nesting rule decides: a child is
/// terminal before its parent moves on, which reverts child tasks before the
/// parent tasks they depend on, but also commits them first.
///
/// ```text
///   A     B
///    \   /
///      C
///      |
///      D
/// ```
///
/// Forward: `A` and `B` start immediately, `C` waits for both and `D` for
/// `C`. Reverse: `D` starts immediately, `C` waits for `D`, `A` and `B` wait
/// for `C`.
pub(super) struct OrderedPlan<'a> {
    nodes: &'a [Arc<TaskNode>],
    /// Nodes unblocked by each node.
    successors: Vec<Vec<usize>>,
    /// Number of nodes each node still waits for.
    waiting: Vec<AtomicUsize>,
    halted: AtomicBool,
    failure: Mutex<Option<(TaskId, TaskFailure)>>,
}

impl<'a> OrderedPlan<'a> {
    pub(super) fn new(nodes: &'a [Arc<TaskNode>], direction: Direction) -> Self {
        let index: HashMap<TaskId, usize> = {
            let mut index = HashMap::with_capacity_and_hasher(nodes.len(), FxBuildHasher);
            index.extend(nodes.iter().enumerate().map(|(idx, node)| (node.id, idx)));
            index
        };
        let mut successors = vec![Vec::new(); nodes.len()];
        let mut waiting = vec![0_usize; nodes.len()];
        for (dependent, node) in nodes.iter().enumerate() {
            for dep in node.deps() {
                let Some(&dependency) = index.get(&dep.id) else {
                    continue;
                };
                let (first, then) = match direction {
                    Direction::Forward => (dependency, dependent),
                    Direction::Reverse => (dependent, dependency),
                };
                successors[first].push(then);
                waiting[then] += 1;
            }
        }
        Self {
            nodes,
            successors,
            waiting: waiting.into_iter().map(AtomicUsize::new).collect(),
            halted: AtomicBool::new(false),
            failure: Mutex::new(None),
        }
    }

    /// Run `step` on every node in plan order. After the first failure no
    /// further steps start; steps already running finish.
    pub(super) fn run<F>(self, pool: &ThreadPool, step: &F) -> Result<(), (TaskId, TaskFailure)>
    where
        F: Fn(&TaskNode) -> Result<(), TaskFailure> + Sync,
    {
        let roots: Vec<usize> = self
            .waiting
            .iter()
            .enumerate()
            .filter(|(_, waiting)| waiting.load(Ordering::Relaxed) == 0)
            .map(|(idx, _)| idx)
            .collect();
        let plan = &self;
        pool.scope(|scope| {
            for idx in roots {
                scope.spawn(move |scope| plan.run_one(scope, idx, step));
            }
        });
        match lock(&self.failure).take() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    fn run_one<'s, F>(&'s self, scope: &Scope<'s>, idx: usize, step: &'s F)
    where
        F: Fn(&TaskNode) -> Result<(), TaskFailure> + Sync,
    {
        if self.halted.load(Ordering::Acquire) {
            return;
        }
        let node = &self.nodes[idx];
        if let Err(failure) = step(node) {
            self.halted.store(true, Ordering::Release);
            lock(&self.failure).get_or_insert((node.id, failure));
            return;
        }
        for &next in &self.successors[idx] {
            if self.waiting[next].fetch_sub(1, Ordering::AcqRel) == 1 {
                scope.spawn(move |scope| self.run_one(scope, next, step));
            }
        }
    }
}
