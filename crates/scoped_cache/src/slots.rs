// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Type-erased slot storage.

use std::{
    any::Any,
    borrow::Cow,
    panic::{AssertUnwindSafe, catch_unwind},
};

use futures::future::{BoxFuture, Shared};

use crate::{error::CacheError, key::ReleaseFn, release::ReleaseError};

pub(crate) type SharedOutcome<T> = Shared<BoxFuture<'static, Result<T, CacheError>>>;

/// One occupied slot in either of the cache maps.
pub(crate) trait Entry: Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Returns what is needed to release the value of this slot, if it holds a releasable value.
    fn releaser(&self) -> Option<Releaser>;
}

impl dyn Entry {
    pub(crate) fn downcast<E: 'static>(&self) -> &E {
        self.as_any()
            .downcast_ref()
            .expect("slot keys include the value type, so the entry type always matches")
    }

    pub(crate) fn downcast_mut<E: 'static>(&mut self) -> &mut E {
        self.as_any_mut()
            .downcast_mut()
            .expect("slot keys include the value type, so the entry type always matches")
    }
}

/// A value stored by the synchronous accessors.
pub(crate) struct Stored<T> {
    pub(crate) value: T,
    key: Cow<'static, str>,
    release: Option<ReleaseFn<T>>,
}

impl<T> Stored<T> {
    pub(crate) fn new(key: Cow<'static, str>, value: T, release: Option<ReleaseFn<T>>) -> Self {
        Self { value, key, release }
    }
}

impl<T: Clone + Send + Sync + 'static> Entry for Stored<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn releaser(&self) -> Option<Releaser> {
        Releaser::new(&self.key, &self.value, self.release)
    }
}

/// A value computed by the asynchronous accessors.
pub(crate) struct Computation<T> {
    pub(crate) state: ComputationState<T>,
    key: Cow<'static, str>,
    release: Option<ReleaseFn<T>>,
}

pub(crate) enum ComputationState<T> {
    Pending(SharedOutcome<T>),
    Ready(Result<T, CacheError>),
}

impl<T> Computation<T> {
    pub(crate) fn pending(key: Cow<'static, str>, outcome: SharedOutcome<T>, release: Option<ReleaseFn<T>>) -> Self {
        Self {
            state: ComputationState::Pending(outcome),
            key,
            release,
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Entry for Computation<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn releaser(&self) -> Option<Releaser> {
        match &self.state {
            ComputationState::Ready(Ok(value)) => Releaser::new(&self.key, value, self.release),
            ComputationState::Ready(Err(_)) | ComputationState::Pending(_) => None,
        }
    }
}

/// A deferred release of one cached value, run outside of the cache lock.
pub(crate) struct Releaser {
    key: Cow<'static, str>,
    release: Box<dyn FnOnce() -> Result<(), ReleaseError> + Send>,
}

impl Releaser {
    pub(crate) fn new<T>(key: &Cow<'static, str>, value: &T, release: Option<ReleaseFn<T>>) -> Option<Self>
    where
        T: Clone + Send + 'static,
    {
        let release = release?;
        let value = value.clone();
        Some(Self {
            key: key.clone(),
            release: Box::new(move || release(&value)),
        })
    }

    pub(crate) fn key(&self) -> &Cow<'static, str> {
        &self.key
    }

    /// Releases the value. A panic in the release operation is reported as an error.
    pub(crate) fn run(self) -> Result<(), ReleaseError> {
        catch_unwind(AssertUnwindSafe(self.release)).unwrap_or_else(|_| Err("release panicked".into()))
    }
}
