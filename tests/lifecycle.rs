#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

mod common;

use common::Recorder;
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
        mpsc,
    },
    thread,
    time::Duration,
};
use txgraph::{
    task::{Facets, TaskBuilderError, TaskFailure, TaskOutcome, TaskState},
    transaction::{TransactionError, TransactionOutcome, TransactionPhase},
};

#[test]
fn single_task_executes_then_commits() {
    let executor = common::executor();
    let root = executor.new_transaction();
    let recorder = Recorder::default();

    let mut builder = root.new_task(|| -> anyhow::Result<u32> { Ok(42) });
    builder
        .set_committable(Some(Box::new(recorder.step("commit x"))))
        .unwrap();
    let x = builder.release(|_, _| {}).unwrap();

    assert!(x.wait().is_executed());
    assert_eq!(x.state(), TaskState::Executed);
    assert_eq!(x.result(), Some(&42));
    assert_eq!(root.phase(), TransactionPhase::Active);

    assert_eq!(root.commit().unwrap(), TransactionOutcome::Committed);
    assert_eq!(x.state(), TaskState::Committed);
    assert_eq!(root.phase(), TransactionPhase::Committed);
    assert_eq!(recorder.events(), ["commit x"]);
}

#[test]
fn execution_failure_reverts_executed_dependencies() {
    let executor = common::executor();
    let root = executor.new_transaction();
    let recorder = Recorder::default();

    let observed = root.clone();
    let revert_a = {
        let recorder = recorder.clone();
        move || -> anyhow::Result<()> {
            recorder.record(format!("revert a during {:?}", observed.phase()));
            Ok(())
        }
    };
    let a = root
        .build_task(
            (),
            Facets::new()
                .executable(|| -> anyhow::Result<u32> { Ok(1) })
                .revertible(revert_a)
                .committable(recorder.step("commit a")),
        )
        .release(|_, _| {})
        .unwrap();
    let mut b = root.new_task(|| -> anyhow::Result<u32> { anyhow::bail!("b refuses") });
    b.add_dependency(&a).unwrap();
    let b = b.release(|_, _| {}).unwrap();

    let outcome = b.wait();
    assert!(matches!(outcome, TaskOutcome::ExecutionFailed(TaskFailure::Facet(_))));
    assert_eq!(outcome.failure().unwrap().to_string(), "b refuses");
    assert_eq!(a.state(), TaskState::Executed);
    assert_eq!(b.state(), TaskState::ExecutionFailed);

    assert_eq!(root.commit().unwrap(), TransactionOutcome::RolledBack);
    assert_eq!(root.phase(), TransactionPhase::RolledBack);
    assert_eq!(recorder.events(), ["revert a during RollingBack"]);
    assert_eq!(a.state(), TaskState::RolledBack);
    assert_eq!(b.state(), TaskState::RolledBack);
    assert!(b.result().is_none());
}

#[test]
fn released_builder_rejects_every_mutation() {
    let executor = common::executor();
    let root = executor.new_transaction();
    let dep = root
        .new_task(|| -> anyhow::Result<()> { Ok(()) })
        .release(|_, _| {})
        .unwrap();

    let mut builder = root.new_task(|| -> anyhow::Result<u32> { Ok(1) });
    let x = builder.release(|_, _| {}).unwrap();
    assert!(builder.is_released());

    let illegal = TaskBuilderError::IllegalState(x.id());
    assert_eq!(builder.add_dependency(&dep).unwrap_err(), illegal);
    assert_eq!(builder.add_dependencies([dep.handle()]).unwrap_err(), illegal);
    assert_eq!(builder.set_executable(None).unwrap_err(), illegal);
    assert_eq!(builder.set_revertible(None).unwrap_err(), illegal);
    assert!(matches!(
        builder.release(|_, _| {}),
        Err(TaskBuilderError::IllegalState(id)) if id == x.id()
    ));

    assert!(x.dependencies().is_empty());
    assert_eq!(root.task_count(), 2);
    assert_eq!(root.commit().unwrap(), TransactionOutcome::Committed);
}

#[test]
fn task_without_executable_still_orders_its_dependents() {
    let executor = common::executor();
    let root = executor.new_transaction();
    let recorder = Recorder::default();

    let first = root
        .new_task({
            let recorder = recorder.clone();
            move || -> anyhow::Result<()> {
                thread::sleep(Duration::from_millis(20));
                recorder.record("first");
                Ok(())
            }
        })
        .release(|_, _| {})
        .unwrap();
    let mut gate = root.build_task((), Facets::<()>::new());
    gate.add_dependency(&first).unwrap();
    let gate = gate.release(|_, _| {}).unwrap();
    let mut last = root.new_task({
        let recorder = recorder.clone();
        move || -> anyhow::Result<()> {
            recorder.record("last");
            Ok(())
        }
    });
    last.add_dependency(&gate).unwrap();
    let last = last.release(|_, _| {}).unwrap();

    assert!(last.wait().is_executed());
    assert_eq!(gate.state(), TaskState::Executed);
    assert!(gate.result().is_none());
    assert_eq!(recorder.events(), ["first", "last"]);
    assert_eq!(root.commit().unwrap(), TransactionOutcome::Committed);
    assert_eq!(gate.state(), TaskState::Committed);
}

#[test]
fn listener_fires_once_even_when_registered_late() {
    let executor = common::executor();
    let root = executor.new_transaction();
    let calls = Arc::new(AtomicUsize::new(0));

    let x = root
        .new_task(|| -> anyhow::Result<&'static str> { Ok("done") })
        .release({
            let calls = Arc::clone(&calls);
            move |controller, outcome| {
                assert!(outcome.is_executed());
                assert_eq!(controller.result(), Some(&"done"));
                calls.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();
    assert!(x.wait().is_executed());

    let caller = thread::current().id();
    let late = Arc::new(AtomicUsize::new(0));
    x.on_complete({
        let late = Arc::clone(&late);
        move |_, outcome| {
            assert!(outcome.is_executed());
            assert_eq!(thread::current().id(), caller);
            late.fetch_add(1, Ordering::SeqCst);
        }
    });
    assert_eq!(late.load(Ordering::SeqCst), 1);

    assert_eq!(root.commit().unwrap(), TransactionOutcome::Committed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(late.load(Ordering::SeqCst), 1);
}

#[test]
fn listener_of_task_with_failed_dependency_fires_during_release() {
    let executor = common::executor();
    let root = executor.new_transaction();

    let broken = root
        .new_task(|| -> anyhow::Result<u32> { anyhow::bail!("no value") })
        .release(|_, _| {})
        .unwrap();
    assert!(!broken.wait().is_executed());

    let seen = Arc::new(AtomicUsize::new(0));
    let mut dependent = root.new_task(|| -> anyhow::Result<u32> { Ok(2) });
    dependent.add_dependency(&broken).unwrap();
    let dependent = dependent
        .release({
            let seen = Arc::clone(&seen);
            move |_, outcome| {
                assert!(matches!(
                    outcome.failure(),
                    Some(TaskFailure::DependencyFailed(_))
                ));
                seen.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(dependent.state(), TaskState::ExecutionFailed);
    assert!(matches!(
        dependent.failure(),
        Some(TaskFailure::DependencyFailed(id)) if id == broken.id()
    ));
    assert_eq!(root.commit().unwrap(), TransactionOutcome::RolledBack);
}

#[test]
fn failure_cascades_through_transitive_dependents() {
    let executor = common::executor();
    let root = executor.new_transaction();
    let recorder = Recorder::default();

    let mut a = root.new_task(|| -> anyhow::Result<()> {
        thread::sleep(Duration::from_millis(20));
        anyhow::bail!("a failed")
    });
    let a = a.release(|_, _| {}).unwrap();
    let mut b = root.new_task({
        let recorder = recorder.clone();
        move || -> anyhow::Result<()> {
            recorder.record("b executed");
            Ok(())
        }
    });
    b.add_dependency(&a).unwrap();
    let b = b.release(|_, _| {}).unwrap();
    let mut c = root.new_task({
        let recorder = recorder.clone();
        move || -> anyhow::Result<()> {
            recorder.record("c executed");
            Ok(())
        }
    });
    c.add_dependency(&b).unwrap();
    let c = c.release(|_, _| {}).unwrap();

    assert!(matches!(
        c.wait().failure(),
        Some(TaskFailure::DependencyFailed(id)) if *id == b.id()
    ));
    assert!(matches!(
        b.failure(),
        Some(TaskFailure::DependencyFailed(id)) if id == a.id()
    ));
    assert!(recorder.events().is_empty());
    assert_eq!(root.commit().unwrap(), TransactionOutcome::RolledBack);
}

#[test]
fn panicking_executable_fails_the_task() {
    let executor = common::executor();
    let root = executor.new_transaction();

    let x = root
        .new_task(|| -> anyhow::Result<u32> { panic!("kaboom") })
        .release(|_, _| {})
        .unwrap();

    match x.wait() {
        TaskOutcome::ExecutionFailed(TaskFailure::Panicked(message)) => {
            assert_eq!(&*message, "kaboom");
        }
        outcome => panic!("unexpected outcome {outcome:?}"),
    }
    assert_eq!(root.commit().unwrap(), TransactionOutcome::RolledBack);
}

#[test]
fn validation_failure_rolls_back_every_executed_task() {
    let executor = common::executor();
    let root = executor.new_transaction();
    let recorder = Recorder::default();

    let good = root
        .build_task(
            (),
            Facets::new()
                .executable(|| -> anyhow::Result<u32> { Ok(1) })
                .validatable(recorder.step("validate good"))
                .revertible(recorder.step("revert good"))
                .committable(recorder.step("commit good")),
        )
        .release(|_, _| {})
        .unwrap();
    let bad = root
        .build_task(
            (),
            Facets::new()
                .executable(|| -> anyhow::Result<u32> { Ok(2) })
                .validatable(|| -> anyhow::Result<()> { anyhow::bail!("invariant broken") })
                .revertible(recorder.step("revert bad")),
        )
        .release(|_, _| {})
        .unwrap();

    assert_eq!(root.prepare().unwrap(), TransactionOutcome::RolledBack);
    assert_eq!(root.phase(), TransactionPhase::RolledBack);
    assert!(recorder.contains("validate good"));
    assert!(recorder.contains("revert good"));
    assert!(recorder.contains("revert bad"));
    assert!(!recorder.contains("commit good"));
    assert_eq!(good.state(), TaskState::RolledBack);
    assert_eq!(bad.state(), TaskState::RolledBack);
    assert_eq!(bad.failure().unwrap().to_string(), "invariant broken");
    assert!(good.failure().is_none());
}

#[test]
fn prepare_then_commit_in_two_steps() {
    let executor = common::executor();
    let root = executor.new_transaction();
    let recorder = Recorder::default();

    let x = root
        .build_task(
            "subtask",
            Facets::new()
                .executable(|| -> anyhow::Result<u8> { Ok(9) })
                .committable(recorder.step("commit")),
        )
        .release(|_, _| {})
        .unwrap();

    assert_eq!(root.prepare().unwrap(), TransactionOutcome::Prepared);
    assert_eq!(root.phase(), TransactionPhase::Prepared);
    assert_eq!(x.state(), TaskState::Validated);
    assert_eq!(x.subtask::<&str>(), Some(&"subtask"));
    assert!(x.subtask::<u32>().is_none());

    let late = root.new_task(|| -> anyhow::Result<()> { Ok(()) }).release(|_, _| {});
    assert!(matches!(
        late,
        Err(TaskBuilderError::TransactionNotActive {
            phase: TransactionPhase::Prepared,
            ..
        })
    ));
    assert!(matches!(
        root.prepare(),
        Err(TransactionError::InvalidPhase { operation: "prepare", .. })
    ));

    assert_eq!(root.commit().unwrap(), TransactionOutcome::Committed);
    assert_eq!(recorder.events(), ["commit"]);
    assert!(matches!(
        root.rollback(),
        Err(TransactionError::InvalidPhase {
            phase: TransactionPhase::Committed,
            ..
        })
    ));
}

#[test]
fn commit_failure_stops_later_commits() {
    let executor = common::executor();
    let root = executor.new_transaction();
    let recorder = Recorder::default();

    let a = root
        .build_task(
            (),
            Facets::new()
                .executable(|| -> anyhow::Result<()> { Ok(()) })
                .committable(|| -> anyhow::Result<()> { anyhow::bail!("disk full") }),
        )
        .release(|_, _| {})
        .unwrap();
    let mut b = root.build_task(
        (),
        Facets::new()
            .executable(|| -> anyhow::Result<()> { Ok(()) })
            .committable(recorder.step("commit b")),
    );
    b.add_dependency(&a).unwrap();
    let b = b.release(|_, _| {}).unwrap();

    match root.commit() {
        Err(TransactionError::CommitFailed { task, failure }) => {
            assert_eq!(task, a.id());
            assert_eq!(failure.to_string(), "disk full");
        }
        other => panic!("unexpected commit result {other:?}"),
    }
    assert_eq!(root.phase(), TransactionPhase::Committed);
    assert_eq!(a.state(), TaskState::Committing);
    assert_eq!(b.state(), TaskState::Validated);
    assert!(recorder.events().is_empty());
}

#[test]
fn revert_failure_stops_the_rollback() {
    let executor = common::executor();
    let root = executor.new_transaction();
    let recorder = Recorder::default();

    let a = root
        .build_task(
            (),
            Facets::new()
                .executable(|| -> anyhow::Result<()> { Ok(()) })
                .revertible(recorder.step("revert a")),
        )
        .release(|_, _| {})
        .unwrap();
    let mut b = root.build_task(
        (),
        Facets::new()
            .executable(|| -> anyhow::Result<()> { Ok(()) })
            .revertible(|| -> anyhow::Result<()> { anyhow::bail!("cannot undo") }),
    );
    b.add_dependency(&a).unwrap();
    let b = b.release(|_, _| {}).unwrap();
    assert!(b.wait().is_executed());

    match root.rollback() {
        Err(TransactionError::RevertFailed { task, failure }) => {
            assert_eq!(task, b.id());
            assert_eq!(failure.to_string(), "cannot undo");
        }
        other => panic!("unexpected rollback result {other:?}"),
    }
    assert_eq!(root.phase(), TransactionPhase::RolledBack);
    assert_eq!(b.state(), TaskState::RollingBack);
    assert_eq!(a.state(), TaskState::Executed);
    assert!(recorder.events().is_empty());
}

#[test]
fn rollback_cancels_tasks_still_waiting_for_dependencies() {
    let executor = common::executor();
    let root = executor.new_transaction();
    let recorder = Recorder::default();

    let observed = root.clone();
    let (started_tx, started) = mpsc::channel();
    let slow = root
        .build_task(
            (),
            Facets::new()
                .executable(move || -> anyhow::Result<()> {
                    started_tx.send(())?;
                    while observed.phase() == TransactionPhase::Active {
                        thread::sleep(Duration::from_millis(1));
                    }
                    Ok(())
                })
                .revertible(recorder.step("revert slow")),
        )
        .release(|_, _| {})
        .unwrap();
    let mut waiting = root.build_task(
        (),
        Facets::new()
            .executable(recorder.step("execute waiting"))
            .revertible(recorder.step("revert waiting")),
    );
    waiting.add_dependency(&slow).unwrap();
    let waiting = waiting.release(|_, _| {}).unwrap();

    started.recv().unwrap();
    root.rollback().unwrap();

    assert!(matches!(waiting.wait(), TaskOutcome::RolledBack));
    assert_eq!(waiting.state(), TaskState::RolledBack);
    assert_eq!(slow.state(), TaskState::RolledBack);
    assert_eq!(recorder.events(), ["revert slow"]);
}
