// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! [`ScopedCache`] and its builder.

use std::{
    borrow::Cow,
    collections::HashMap,
    convert::Infallible,
    error::Error as StdError,
    fmt::{self, Debug},
    sync::{Arc, Weak},
};

use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{
    error::{CacheError, CloseError},
    key::{Key, ReleaseFn, SlotKey},
    release::ReleaseError,
    scope::{Scope, Termination},
    slots::{Computation, ComputationState, Entry, Releaser, SharedOutcome, Stored},
};

/// A cache of typed values whose lifetime is bound to a [`Scope`].
///
/// Values are computed on first access by a caller-supplied provider, at most once per key, and
/// handed out as clones; store an [`Arc`] for values that are expensive to clone or must be
/// shared.
///
/// The cache runs its background computations on a child of the owning scope. It closes when
/// that child ends: when the owner is cancelled or closed, when [`ScopedCache::close`] is called,
/// or when the last handle to the cache is dropped. Closing cancels computations still in flight
/// and releases every value stored under a [releasable](Key::releasable) key exactly once.
///
/// `ScopedCache` is a cheap handle; clones refer to the same cache.
#[derive(Clone)]
pub struct ScopedCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    name: Cow<'static, str>,
    scope: Scope,
    state: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    closed: bool,
    values: HashMap<SlotKey, Box<dyn Entry>>,
    computations: HashMap<SlotKey, Box<dyn Entry>>,
}

enum Lookup<T> {
    Ready(Result<T, CacheError>),
    Pending(SharedOutcome<T>),
    Started(SharedOutcome<T>),
}

impl ScopedCache {
    /// Creates a cache bound to `owner`.
    ///
    /// # Example
    ///
    /// ```
    /// use scoped_cache::{ScopedCache, Scope};
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() {
    /// let owner = Scope::new();
    /// let cache = ScopedCache::new(&owner);
    /// owner.cancel();
    /// assert!(cache.is_closed());
    /// # }
    /// ```
    #[must_use]
    pub fn new(owner: &Scope) -> Self {
        Self::builder(owner).build()
    }

    /// Returns a builder to configure a cache bound to `owner`.
    #[must_use]
    pub fn builder(owner: &Scope) -> ScopedCacheBuilder<'_> {
        ScopedCacheBuilder { owner, name: None }
    }

    /// Returns the name used for this cache in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the scope background computations of this cache run on.
    ///
    /// Work spawned on this scope is cancelled when the cache closes.
    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.inner.scope
    }

    /// Returns `true` once the cache has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Returns the value stored for `key`, computing it with `provider` if there is none.
    ///
    /// The lookup, the provider call and the insertion happen under the cache lock, so `provider`
    /// runs at most once per key no matter how many threads ask concurrently. The provider should
    /// be fast and must not access this cache.
    ///
    /// This accessor does not share storage with [`ScopedCache::get_or_put_async`]; the same key
    /// used with both yields two independent values.
    ///
    /// If the cache has already closed, a newly computed releasable value is stored and released
    /// right away.
    ///
    /// # Example
    ///
    /// ```
    /// use scoped_cache::{Key, ScopedCache, Scope};
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() {
    /// let cache = ScopedCache::new(&Scope::new());
    /// let key: Key<String> = Key::new("model");
    ///
    /// assert_eq!(cache.get_or_put(&key, || "Pixel".to_string()), "Pixel");
    /// assert_eq!(cache.get_or_put(&key, || "ignored".to_string()), "Pixel");
    /// # }
    /// ```
    pub fn get_or_put<T>(&self, key: &Key<T>, provider: impl FnOnce() -> T) -> T
    where
        T: Clone + Send + Sync + 'static,
    {
        match self.try_get_or_put(key, || Ok::<_, Infallible>(provider())) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Like [`ScopedCache::get_or_put`], but with a fallible provider.
    ///
    /// # Errors
    ///
    /// Returns the provider's error. Nothing is stored in that case, so the next call for the
    /// same key runs a provider again.
    pub fn try_get_or_put<T, E>(&self, key: &Key<T>, provider: impl FnOnce() -> Result<T, E>) -> Result<T, E>
    where
        T: Clone + Send + Sync + 'static,
    {
        let slot = key.slot_key();
        let mut state = self.inner.state.lock();
        if let Some(entry) = state.values.get(&slot) {
            trace!(cache = %self.inner.name, key = %key, "cache hit");
            return Ok(entry.downcast::<Stored<T>>().value.clone());
        }

        let value = provider()?;
        let stored = Stored::new(key.label_cow(), value.clone(), key.release_fn());
        let late = if state.closed { stored.releaser() } else { None };
        state.values.insert(slot, Box::new(stored));
        drop(state);

        debug!(cache = %self.inner.name, key = %key, "value stored");
        if let Some(releaser) = late {
            release_all(&self.inner.name, vec![releaser]);
        }
        Ok(value)
    }

    /// Returns the value computed for `key`, starting the computation if there is none.
    ///
    /// The first caller for a key spawns `provider`'s future on the cache scope and waits for
    /// it; callers arriving while it runs wait for the same computation. The outcome, success or
    /// failure, is stored permanently: later calls return it without recomputing.
    ///
    /// # Errors
    ///
    /// - [`CacheError::Failed`] if the provider returned an error, now or in an earlier call.
    /// - [`CacheError::Cancelled`] if the cache closed while the value was being computed.
    /// - [`CacheError::Panicked`] if the provider panicked.
    /// - [`CacheError::Closed`] if the cache had closed before any computation was started.
    ///
    /// # Example
    ///
    /// ```
    /// use scoped_cache::{Key, ScopedCache, Scope};
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() -> Result<(), scoped_cache::CacheError> {
    /// let cache = ScopedCache::new(&Scope::new());
    /// let key: Key<u32> = Key::new("api level");
    ///
    /// let level = cache.get_or_put_async(&key, || async { Ok::<_, std::io::Error>(34) }).await?;
    /// assert_eq!(level, 34);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn get_or_put_async<T, F, Fut, E>(&self, key: &Key<T>, provider: F) -> Result<T, CacheError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        match self.lookup_or_start(key, provider) {
            Lookup::Ready(outcome) => outcome,
            Lookup::Pending(outcome) | Lookup::Started(outcome) => outcome.await,
        }
    }

    /// Like [`ScopedCache::get_or_put_async`], but does not wait for a computation it starts.
    ///
    /// If this call starts the computation and it has not finished yet, `fast_default`'s value is
    /// returned right away while the computation continues in the background. Once the
    /// computation finishes, its outcome is what every later call returns. Callers that find a
    /// computation already running wait for it like [`ScopedCache::get_or_put_async`] does.
    ///
    /// # Errors
    ///
    /// Same as [`ScopedCache::get_or_put_async`].
    ///
    /// # Example
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use scoped_cache::{Key, ScopedCache, Scope};
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() -> Result<(), scoped_cache::CacheError> {
    /// let cache = ScopedCache::new(&Scope::new());
    /// let key: Key<&str> = Key::new("features");
    ///
    /// let slow = || async {
    ///     tokio::time::sleep(Duration::from_millis(10)).await;
    ///     Ok::<_, std::io::Error>("shell_v2,cmd")
    /// };
    /// assert_eq!(cache.get_or_put_async_fast(&key, || "", slow).await?, "");
    ///
    /// tokio::time::sleep(Duration::from_millis(50)).await;
    /// assert_eq!(cache.get_or_put_async_fast(&key, || "", slow).await?, "shell_v2,cmd");
    /// # Ok(())
    /// # }
    /// ```
    pub async fn get_or_put_async_fast<T, D, F, Fut, E>(
        &self,
        key: &Key<T>,
        fast_default: D,
        provider: F,
    ) -> Result<T, CacheError>
    where
        T: Clone + Send + Sync + 'static,
        D: FnOnce() -> T,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        match self.lookup_or_start(key, provider) {
            Lookup::Ready(outcome) => outcome,
            Lookup::Pending(outcome) => outcome.await,
            Lookup::Started(_) => self.settled_or_default(key, fast_default),
        }
    }

    /// Returns the recorded outcome for `key` if its computation already finished, or the fast
    /// default otherwise.
    fn settled_or_default<T>(&self, key: &Key<T>, fast_default: impl FnOnce() -> T) -> Result<T, CacheError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let settled = self
            .inner
            .state
            .lock()
            .computations
            .get(&key.slot_key())
            .and_then(|entry| match &entry.downcast::<Computation<T>>().state {
                ComputationState::Ready(outcome) => Some(outcome.clone()),
                ComputationState::Pending(_) => None,
            });

        settled.unwrap_or_else(|| {
            trace!(cache = %self.inner.name, key = %key, "returning fast default");
            Ok(fast_default())
        })
    }

    /// Closes the cache.
    ///
    /// Cancels computations still in flight and releases every releasable value. Values already
    /// stored stay readable. Calling this again does nothing.
    ///
    /// # Errors
    ///
    /// Returns the release failures, if any. Every value is given a chance to release even if
    /// others fail.
    pub fn close(&self) -> Result<(), CloseError> {
        let failures = self.inner.close_values();
        self.inner.scope.cancel();
        CloseError::from_failures(failures).map_or(Ok(()), Err)
    }

    fn lookup_or_start<T, F, Fut, E>(&self, key: &Key<T>, provider: F) -> Lookup<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        let slot = key.slot_key();
        let mut state = self.inner.state.lock();
        if let Some(entry) = state.computations.get(&slot) {
            return match &entry.downcast::<Computation<T>>().state {
                ComputationState::Ready(outcome) => {
                    trace!(cache = %self.inner.name, key = %key, "cache hit");
                    Lookup::Ready(outcome.clone())
                }
                ComputationState::Pending(outcome) => {
                    trace!(cache = %self.inner.name, key = %key, "joining computation in flight");
                    Lookup::Pending(outcome.clone())
                }
            };
        }

        if state.closed {
            return Lookup::Ready(Err(CacheError::Closed { key: key.label_cow() }));
        }

        let label = key.label_cow();
        let release = key.release_fn();
        let cache = Arc::downgrade(&self.inner);
        let task_slot = slot.clone();
        let task_label = label.clone();
        let work = provider();

        let Some(task) = self.inner.scope.spawn(async move {
            let outcome = work.await.map_err(|error| CacheError::failed(task_label.clone(), error));
            complete(&cache, &task_slot, &task_label, release, &outcome);
            outcome
        }) else {
            return Lookup::Ready(Err(CacheError::Closed { key: label }));
        };

        let task_label = label.clone();
        let outcome = task
            .map(move |result| match result {
                Ok(outcome) => outcome,
                Err(error) => Err(CacheError::from_task(task_label, error)),
            })
            .boxed()
            .shared();

        state
            .computations
            .insert(slot, Box::new(Computation::pending(label, outcome.clone(), release)));
        drop(state);

        debug!(cache = %self.inner.name, key = %key, "computation started");
        Lookup::Started(outcome)
    }
}

impl Debug for ScopedCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ScopedCache")
            .field("name", &self.inner.name)
            .field("closed", &state.closed)
            .field("values", &state.values.len())
            .field("computations", &state.computations.len())
            .finish_non_exhaustive()
    }
}

impl CacheInner {
    /// Marks the cache closed and releases what it holds. Only the first call does any work.
    fn close_values(&self) -> Vec<(Cow<'static, str>, ReleaseError)> {
        let releasers: Vec<_> = {
            let mut state = self.state.lock();
            if state.closed {
                return Vec::new();
            }
            state.closed = true;
            state
                .values
                .values()
                .chain(state.computations.values())
                .filter_map(|entry| entry.releaser())
                .collect()
        };

        debug!(cache = %self.name, releasable = releasers.len(), "cache closed");
        release_all(&self.name, releasers)
    }
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        self.close_values();
    }
}

/// Records the outcome of a computation, or releases its value if the cache closed meanwhile.
///
/// Runs inside the spawned task without awaiting, so cancellation cannot interleave with it.
fn complete<T>(
    cache: &Weak<CacheInner>,
    slot: &SlotKey,
    key: &Cow<'static, str>,
    release: Option<ReleaseFn<T>>,
    outcome: &Result<T, CacheError>,
) where
    T: Clone + Send + Sync + 'static,
{
    let recorded = cache.upgrade().is_some_and(|inner| {
        let mut state = inner.state.lock();
        if state.closed {
            return false;
        }
        if let Some(entry) = state.computations.get_mut(slot) {
            entry.downcast_mut::<Computation<T>>().state = ComputationState::Ready(outcome.clone());
        }
        drop(state);
        debug!(cache = %inner.name, key = %key, succeeded = outcome.is_ok(), "computation finished");
        true
    });

    if !recorded
        && let Ok(value) = outcome
        && let Some(releaser) = Releaser::new(key, value, release)
    {
        release_all("closed cache", vec![releaser]);
    }
}

fn release_all(cache: &str, releasers: Vec<Releaser>) -> Vec<(Cow<'static, str>, ReleaseError)> {
    releasers
        .into_iter()
        .filter_map(|releaser| {
            let key = releaser.key().clone();
            match releaser.run() {
                Ok(()) => None,
                Err(error) => {
                    warn!(cache, key = %key, error = %error, "failed to release cached value");
                    Some((key, error))
                }
            }
        })
        .collect()
}

/// Configures and creates a [`ScopedCache`].
#[derive(Debug)]
pub struct ScopedCacheBuilder<'a> {
    owner: &'a Scope,
    name: Option<Cow<'static, str>>,
}

impl ScopedCacheBuilder<'_> {
    /// Sets the name used for the cache and its scope in logs.
    #[must_use]
    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Creates the cache.
    ///
    /// If the owner has already ended, the cache is created closed.
    #[must_use]
    pub fn build(self) -> ScopedCache {
        let name = self.name.unwrap_or(Cow::Borrowed("scoped_cache"));
        let inner = Arc::new(CacheInner {
            scope: self.owner.child_named(name.clone()),
            name,
            state: Mutex::new(CacheState::default()),
        });

        let cache = Arc::downgrade(&inner);
        inner.scope.on_termination(move |termination: Termination| {
            if let Some(inner) = cache.upgrade() {
                debug!(cache = %inner.name, ?termination, "owning scope ended");
                inner.close_values();
            }
        });

        ScopedCache { inner }
    }
}
