// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! [`Scope`], a cancellable lifetime that owns the tasks spawned within it.

use std::{
    borrow::Cow,
    fmt::{self, Debug},
    mem,
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll, ready},
};

use parking_lot::Mutex;
use tokio::{runtime::Handle, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::debug;

use crate::error::TaskError;

type Hook = Box<dyn FnOnce(Termination) + Send>;

/// How a [`Scope`] came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The scope was closed gracefully after all of its tasks finished.
    Completed,
    /// The scope was cancelled; its unfinished tasks were dropped.
    Cancelled,
}

/// A cancellable lifetime that owns the tasks spawned within it.
///
/// A scope can:
///
/// - run futures as tasks tied to its lifetime ([`Scope::spawn`]),
/// - notify interested parties when it ends ([`Scope::on_termination`]),
/// - own child scopes that end together with it ([`Scope::child`]).
///
/// A scope ends exactly once, either by [`Scope::cancel`], which drops all unfinished tasks at
/// their next await point, or by [`Scope::close`], which waits for them to finish. Dropping the
/// last handle of a scope that has not ended cancels it. Child scopes keep their parent alive.
///
/// `Scope` is a cheap handle; clones refer to the same lifetime.
///
/// # Example
///
/// ```
/// use scoped_cache::{Scope, Termination};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let scope = Scope::new();
/// scope.on_termination(|termination| assert_eq!(termination, Termination::Cancelled));
///
/// let task = scope.spawn(std::future::pending::<()>()).expect("scope is active");
/// scope.cancel();
/// assert!(task.await.is_err());
/// assert!(scope.spawn(async {}).is_none());
/// # }
/// ```
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    name: Cow<'static, str>,
    runtime: Handle,
    token: CancellationToken,
    tracker: TaskTracker,
    state: Mutex<ScopeState>,
    // Children keep their parent alive, the parent only tracks its children weakly.
    _parent: Option<Arc<ScopeInner>>,
}

#[derive(Default)]
struct ScopeState {
    terminated: Option<Termination>,
    closing: bool,
    hooks: Vec<Hook>,
    children: Vec<Weak<ScopeInner>>,
}

impl Scope {
    /// Creates a root scope that runs its tasks on the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime context.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a root scope that runs its tasks on the given runtime.
    #[must_use]
    pub fn with_runtime(runtime: Handle) -> Self {
        Self::builder().runtime(runtime).build()
    }

    /// Returns a builder to configure a root scope.
    #[must_use]
    pub fn builder() -> ScopeBuilder {
        ScopeBuilder::default()
    }

    /// Creates a child scope.
    ///
    /// The child ends when this scope ends, with the same [`Termination`]. Ending the child
    /// leaves this scope untouched. A child created from a scope that already ended is born
    /// ended, and one created while this scope is closing rejects new tasks.
    #[must_use]
    pub fn child(&self) -> Self {
        self.child_named(format!("{}/child", self.inner.name))
    }

    /// Creates a child scope with the given name. See [`Scope::child`].
    #[must_use]
    pub fn child_named(&self, name: impl Into<Cow<'static, str>>) -> Self {
        let child = Arc::new(ScopeInner::new(
            name.into(),
            self.inner.runtime.clone(),
            self.inner.token.child_token(),
            Some(Arc::clone(&self.inner)),
        ));

        let mut state = self.inner.state.lock();
        if let Some(termination) = state.terminated {
            drop(state);
            child.terminate(termination);
        } else {
            // A child of a closing parent is never waited on by that close, so it takes no work.
            if state.closing {
                child.state.lock().closing = true;
            }
            state.children.retain(|child| child.strong_count() > 0);
            state.children.push(Arc::downgrade(&child));
        }

        Self { inner: child }
    }

    /// Returns the name of this scope.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Spawns `future` as a task owned by this scope.
    ///
    /// The task is dropped at its next await point when the scope is cancelled. Returns `None`
    /// if the scope has already ended or is closing.
    ///
    /// The returned [`ScopedTask`] can be awaited for the output, or dropped to let the task run
    /// in the background.
    pub fn spawn<F>(&self, future: F) -> Option<ScopedTask<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let state = self.inner.state.lock();
        if state.terminated.is_some() || state.closing {
            return None;
        }

        let token = self.inner.token.clone();
        let handle = self.inner.tracker.spawn_on(
            async move {
                tokio::select! {
                    biased;
                    () = token.cancelled() => None,
                    output = future => Some(output),
                }
            },
            &self.inner.runtime,
        );
        drop(state);

        Some(ScopedTask { handle })
    }

    /// Registers a hook to run once when this scope ends.
    ///
    /// Hooks run on the thread that ends the scope, after the scope's tasks have been cancelled
    /// (or, for [`Scope::close`], after they finished). If the scope has already ended, the
    /// hook runs immediately.
    pub fn on_termination(&self, hook: impl FnOnce(Termination) + Send + 'static) {
        let mut state = self.inner.state.lock();
        match state.terminated {
            Some(termination) => {
                drop(state);
                hook(termination);
            }
            None => state.hooks.push(Box::new(hook)),
        }
    }

    /// Cancels this scope and all of its children.
    ///
    /// Unfinished tasks are dropped at their next await point and termination hooks run with
    /// [`Termination::Cancelled`]. Does nothing if the scope has already ended.
    pub fn cancel(&self) {
        self.inner.terminate(Termination::Cancelled);
    }

    /// Closes this scope gracefully.
    ///
    /// New tasks are rejected, children are closed, and the call waits for every task of this
    /// scope to finish before termination hooks run with [`Termination::Completed`]. If the scope
    /// is cancelled while closing, the cancellation wins.
    pub async fn close(&self) {
        // Collect the whole subtree first, parents before children.
        let mut scopes = vec![Arc::clone(&self.inner)];
        let mut next = 0;
        while let Some(scope) = scopes.get(next).map(Arc::clone) {
            next += 1;
            let mut state = scope.state.lock();
            if state.terminated.is_some() {
                continue;
            }
            state.closing = true;
            let children: Vec<_> = state.children.iter().filter_map(Weak::upgrade).collect();
            drop(state);
            scopes.extend(children);
        }

        if self.is_terminated() {
            return;
        }

        for scope in scopes.iter().rev() {
            scope.tracker.close();
            scope.tracker.wait().await;
        }
        for scope in scopes.iter().rev() {
            scope.terminate(Termination::Completed);
        }
    }

    /// Waits until this scope is cancelled.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await;
    }

    /// Returns `true` if this scope has been cancelled, directly or through its parent.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Returns `true` if this scope has ended.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.inner.state.lock().terminated.is_some()
    }

    /// Returns how this scope ended, or `None` if it is still active.
    #[must_use]
    pub fn termination(&self) -> Option<Termination> {
        self.inner.state.lock().terminated
    }

    /// Returns the number of tasks of this scope that have not finished yet.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.inner.tracker.len()
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("name", &self.inner.name)
            .field("termination", &self.termination())
            .field("tasks", &self.inner.tracker.len())
            .finish_non_exhaustive()
    }
}

impl ScopeInner {
    fn new(name: Cow<'static, str>, runtime: Handle, token: CancellationToken, parent: Option<Arc<Self>>) -> Self {
        Self {
            name,
            runtime,
            token,
            tracker: TaskTracker::new(),
            state: Mutex::new(ScopeState::default()),
            _parent: parent,
        }
    }

    fn terminate(&self, termination: Termination) {
        let (hooks, children) = {
            let mut state = self.state.lock();
            if state.terminated.is_some() {
                return;
            }
            state.terminated = Some(termination);
            (mem::take(&mut state.hooks), mem::take(&mut state.children))
        };

        self.tracker.close();
        // A completed scope must not leave tasks running behind it.
        if termination == Termination::Cancelled || !self.tracker.is_empty() {
            self.token.cancel();
        }
        debug!(scope = %self.name, ?termination, "scope terminated");

        for child in children.iter().filter_map(Weak::upgrade) {
            child.terminate(termination);
        }
        for hook in hooks {
            hook(termination);
        }
    }
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        self.terminate(Termination::Cancelled);
    }
}

/// Configures and creates a root [`Scope`].
#[derive(Debug, Default)]
pub struct ScopeBuilder {
    name: Option<Cow<'static, str>>,
    runtime: Option<Handle>,
}

impl ScopeBuilder {
    /// Sets the name used for the scope in logs.
    #[must_use]
    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the runtime the scope's tasks run on.
    #[must_use]
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Creates the scope.
    ///
    /// # Panics
    ///
    /// Panics if no runtime was set and this is called outside of a Tokio runtime context.
    #[must_use]
    pub fn build(self) -> Scope {
        let runtime = self.runtime.unwrap_or_else(Handle::current);
        let name = self.name.unwrap_or(Cow::Borrowed("scope"));
        Scope {
            inner: Arc::new(ScopeInner::new(name, runtime, CancellationToken::new(), None)),
        }
    }
}

/// A handle to a task spawned on a [`Scope`].
///
/// Awaiting the handle yields the task's output, or a [`TaskError`] if the scope was cancelled
/// before the task finished or the task panicked. Dropping the handle detaches the task.
pub struct ScopedTask<T> {
    handle: JoinHandle<Option<T>>,
}

impl<T> ScopedTask<T> {
    /// Returns `true` if the task has finished, successfully or not.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl<T> Future for ScopedTask<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = ready!(Pin::new(&mut self.get_mut().handle).poll(cx));
        Poll::Ready(match result {
            Ok(Some(output)) => Ok(output),
            Ok(None) => Err(TaskError::Cancelled),
            Err(error) if error.is_panic() => Err(TaskError::Panicked),
            Err(_) => Err(TaskError::Cancelled),
        })
    }
}

impl<T> Debug for ScopedTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedTask")
            .field("finished", &self.handle.is_finished())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn terminate_runs_hooks_once() {
        let scope = Scope::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        scope.on_termination(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        scope.cancel();
        scope.cancel();
        scope.close().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(scope.termination(), Some(Termination::Cancelled));
    }

    #[tokio::test]
    async fn dropping_last_handle_cancels() {
        let scope = Scope::new();
        let observer = scope.child();
        drop(scope);

        // The child keeps the parent alive, so nothing ended yet.
        assert!(!observer.is_terminated());

        let grandchild = observer.child();
        drop(observer);
        assert!(!grandchild.is_terminated());
        let token = grandchild.inner.token.clone();
        drop(grandchild);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn completing_with_unfinished_tasks_cancels_them() {
        let scope = Scope::new();
        let task = scope.spawn(std::future::pending::<()>()).expect("scope is active");

        scope.inner.terminate(Termination::Completed);

        assert_eq!(task.await, Err(TaskError::Cancelled));
        assert_eq!(scope.termination(), Some(Termination::Completed));
    }

    #[tokio::test]
    async fn completing_an_idle_scope_does_not_cancel_it() {
        let scope = Scope::new();
        scope.inner.terminate(Termination::Completed);
        assert!(!scope.is_cancelled());
    }

    #[tokio::test]
    async fn dead_children_are_pruned() {
        let scope = Scope::new();
        for _ in 0..8 {
            drop(scope.child());
        }
        let _live = scope.child();
        assert_eq!(scope.inner.state.lock().children.len(), 1);
    }

    #[tokio::test]
    async fn debug_shows_name_and_state() {
        let scope = Scope::builder().name("device").build();
        let debug = format!("{scope:?}");
        assert!(debug.contains("device"));
        assert!(debug.contains("None"));
        assert_eq!(scope.child().name(), "device/child");
    }
}
