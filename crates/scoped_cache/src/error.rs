// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::{borrow::Cow, error::Error as StdError, sync::Arc};

use thiserror::Error;

use crate::release::ReleaseError;

/// A shared, type-erased provider error.
pub(crate) type SharedError = Arc<dyn StdError + Send + Sync>;

/// An error returned by the asynchronous cache accessors.
///
/// The outcome of a computation is stored in the cache, so the same error is handed to every
/// caller that waits for it or asks for the key later. This is why the type is [`Clone`] and the
/// provider error is kept behind an [`Arc`].
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CacheError {
    /// The provider returned an error.
    #[error("computing the value for key '{key}' failed: {source}")]
    Failed {
        /// Label of the key whose value could not be computed.
        key: Cow<'static, str>,
        /// The error returned by the provider.
        source: SharedError,
    },

    /// The computation was cancelled because the owning scope terminated.
    #[error("computing the value for key '{key}' was cancelled")]
    Cancelled {
        /// Label of the key whose computation was cancelled.
        key: Cow<'static, str>,
    },

    /// The provider panicked.
    #[error("computing the value for key '{key}' panicked")]
    Panicked {
        /// Label of the key whose provider panicked.
        key: Cow<'static, str>,
    },

    /// The cache had already closed, so no computation was started.
    #[error("the cache was closed before the value for key '{key}' was computed")]
    Closed {
        /// Label of the key that was requested.
        key: Cow<'static, str>,
    },
}

impl CacheError {
    pub(crate) fn failed(key: Cow<'static, str>, source: impl StdError + Send + Sync + 'static) -> Self {
        Self::Failed {
            key,
            source: Arc::new(source),
        }
    }

    pub(crate) fn from_task(key: Cow<'static, str>, error: TaskError) -> Self {
        match error {
            TaskError::Cancelled => Self::Cancelled { key },
            TaskError::Panicked => Self::Panicked { key },
        }
    }

    /// Returns the label of the key this error relates to.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Failed { key, .. } | Self::Cancelled { key } | Self::Panicked { key } | Self::Closed { key } => key,
        }
    }

    /// Returns `true` if the computation was cancelled or never started because the cache closed.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::Closed { .. })
    }

    /// Returns the error returned by the provider, if that is what caused this error.
    #[must_use]
    pub fn provider_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            Self::Failed { source, .. } => Some(&**source),
            _ => None,
        }
    }
}

/// The reason a task spawned on a [`Scope`](crate::Scope) did not produce its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum TaskError {
    /// The scope was cancelled before the task finished.
    #[error("the task was cancelled")]
    Cancelled,

    /// The task panicked.
    #[error("the task panicked")]
    Panicked,
}

/// Release failures collected while closing a cache.
///
/// Closing never stops at the first failure; every releasable value is given a chance to
/// release its resource and all failures are reported together.
#[derive(Debug, Error)]
#[error("failed to release {} cached value(s)", .failures.len())]
pub struct CloseError {
    failures: Vec<(Cow<'static, str>, ReleaseError)>,
}

impl CloseError {
    pub(crate) fn from_failures(failures: Vec<(Cow<'static, str>, ReleaseError)>) -> Option<Self> {
        (!failures.is_empty()).then_some(Self { failures })
    }

    /// Returns the key label and error of each value that failed to release.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &ReleaseError)> {
        self.failures.iter().map(|(key, error)| (&**key, error))
    }

    /// Returns how many values failed to release.
    #[must_use]
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Always `false`; a `CloseError` is only created for at least one failure.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}
