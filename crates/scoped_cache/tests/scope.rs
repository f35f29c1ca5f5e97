// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests for scopes, their tasks and their termination.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use scoped_cache::{Scope, TaskError, Termination};
use tokio::sync::oneshot;

fn record(scope: &Scope) -> Arc<Mutex<Vec<Termination>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    scope.on_termination(move |termination| sink.lock().push(termination));
    seen
}

#[tokio::test]
async fn spawned_task_returns_its_output() {
    let scope = Scope::new();
    let task = scope.spawn(async { 21 * 2 }).expect("scope is active");
    assert_eq!(task.await, Ok(42));
    assert!(!scope.is_terminated());
}

#[tokio::test]
async fn cancel_drops_tasks_and_rejects_new_ones() {
    let scope = Scope::new();
    let task = scope.spawn(std::future::pending::<()>()).expect("scope is active");
    assert_eq!(scope.task_count(), 1);

    scope.cancel();

    assert_eq!(task.await, Err(TaskError::Cancelled));
    assert!(scope.is_cancelled());
    assert_eq!(scope.termination(), Some(Termination::Cancelled));
    assert!(scope.spawn(async {}).is_none());
}

#[tokio::test]
async fn panicking_task_is_reported() {
    let scope = Scope::new();
    let task = scope
        .spawn(async { panic!("task exploded") })
        .expect("scope is active");
    let result: Result<(), TaskError> = task.await;
    assert_eq!(result, Err(TaskError::Panicked));

    // A panicking task does not end its scope.
    assert!(!scope.is_terminated());
}

#[tokio::test]
async fn hook_registered_after_termination_runs_immediately() {
    let scope = Scope::new();
    scope.cancel();

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    scope.on_termination(move |termination| {
        assert_eq!(termination, Termination::Cancelled);
        flag.store(true, Ordering::SeqCst);
    });
    assert!(ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn children_end_with_their_parent() {
    let parent = Scope::new();
    let child = parent.child();
    let grandchild = child.child_named("grandchild");
    let seen = record(&grandchild);

    parent.cancel();

    assert!(child.is_cancelled());
    assert_eq!(grandchild.termination(), Some(Termination::Cancelled));
    assert_eq!(*seen.lock(), [Termination::Cancelled]);
}

#[tokio::test]
async fn ending_a_child_leaves_the_parent_alone() {
    let parent = Scope::new();
    let child = parent.child();

    child.cancel();

    assert!(child.is_terminated());
    assert!(!parent.is_terminated());
    assert!(!parent.is_cancelled());
    assert!(parent.spawn(async {}).is_some());
}

#[tokio::test]
async fn child_of_an_ended_scope_is_born_ended() {
    let parent = Scope::new();
    parent.cancel();

    let child = parent.child();
    assert_eq!(child.termination(), Some(Termination::Cancelled));
    assert!(child.spawn(async {}).is_none());
}

#[tokio::test]
async fn close_waits_for_tasks_of_the_whole_tree() {
    let parent = Scope::new();
    let child = parent.child();
    let finished = Arc::new(AtomicUsize::new(0));

    for scope in [&parent, &child] {
        let finished = Arc::clone(&finished);
        drop(scope.spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            finished.fetch_add(1, Ordering::SeqCst);
        }));
    }
    let parent_seen = record(&parent);
    let child_seen = record(&child);

    parent.close().await;

    assert_eq!(finished.load(Ordering::SeqCst), 2);
    assert_eq!(*parent_seen.lock(), [Termination::Completed]);
    assert_eq!(*child_seen.lock(), [Termination::Completed]);
    assert!(!parent.is_cancelled());
    assert!(parent.spawn(async {}).is_none());
}

#[tokio::test]
async fn cancellation_wins_over_a_close_in_progress() {
    let scope = Scope::new();
    let (started_tx, started_rx) = oneshot::channel();
    drop(scope.spawn(async move {
        let _ = started_tx.send(());
        std::future::pending::<()>().await;
    }));

    let closing = {
        let scope = scope.clone();
        tokio::spawn(async move { scope.close().await })
    };
    started_rx.await.expect("task starts");
    scope.cancel();

    closing.await.expect("close does not panic");
    assert_eq!(scope.termination(), Some(Termination::Cancelled));
}

#[tokio::test]
async fn child_created_while_closing_takes_no_work() {
    let scope = Scope::new();
    let (finish_tx, finish_rx) = oneshot::channel::<()>();
    drop(scope.spawn(async move {
        let _ = finish_rx.await;
    }));

    let closing = {
        let scope = scope.clone();
        tokio::spawn(async move { scope.close().await })
    };
    while scope.spawn(async {}).is_some() {
        tokio::task::yield_now().await;
    }

    let child = scope.child();
    assert!(child.spawn(std::future::pending::<()>()).is_none());
    assert_eq!(child.task_count(), 0);

    let _ = finish_tx.send(());
    closing.await.expect("close does not panic");
    assert_eq!(child.termination(), Some(Termination::Completed));
}

#[tokio::test]
async fn cancelled_resolves_on_cancel() {
    let scope = Scope::new();
    let waiter = {
        let scope = scope.clone();
        tokio::spawn(async move { scope.cancelled().await })
    };

    scope.cancel();
    tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("cancelled() resolves")
        .expect("waiter does not panic");
}

#[tokio::test]
async fn dropping_the_last_handle_cancels_tasks() {
    let scope = Scope::new();
    let task = scope.spawn(std::future::pending::<()>()).expect("scope is active");

    drop(scope);

    assert_eq!(task.await, Err(TaskError::Cancelled));
}

#[test]
fn runs_tasks_on_the_given_runtime() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .build()
        .expect("runtime builds");
    let scope = Scope::builder()
        .name("background")
        .runtime(runtime.handle().clone())
        .build();
    assert_eq!(scope.name(), "background");

    let task = scope.spawn(async { "done" }).expect("scope is active");
    assert_eq!(runtime.block_on(task), Ok("done"));

    let other = Scope::with_runtime(runtime.handle().clone());
    assert_eq!(other.name(), "scope");
    drop(other);
    drop(scope);
}
