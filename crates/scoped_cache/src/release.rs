// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;

/// The error a [`Releasable`] value reports when it fails to release its resource.
pub type ReleaseError = Box<dyn std::error::Error + Send + Sync>;

/// A cached value that owns a resource needing explicit cleanup, such as a connection handle.
///
/// Values are released through a shared reference because the cache hands out clones of the
/// stored value; release should therefore be idempotent on the underlying resource.
///
/// # Example
///
/// ```
/// use std::sync::{Arc, atomic::{AtomicBool, Ordering}};
///
/// use scoped_cache::{Key, ReleaseError, Releasable};
///
/// #[derive(Debug, Default)]
/// struct Connection {
///     closed: AtomicBool,
/// }
///
/// impl Releasable for Connection {
///     fn release(&self) -> Result<(), ReleaseError> {
///         self.closed.store(true, Ordering::Release);
///         Ok(())
///     }
/// }
///
/// let key: Key<Arc<Connection>> = Key::new("connection").releasable();
/// assert!(key.is_releasable());
/// ```
pub trait Releasable {
    /// Releases the resource owned by this value.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource could not be released. The cache logs the error and
    /// carries on releasing the remaining values.
    fn release(&self) -> Result<(), ReleaseError>;
}

impl<T: Releasable + ?Sized> Releasable for Arc<T> {
    fn release(&self) -> Result<(), ReleaseError> {
        (**self).release()
    }
}

impl<T: Releasable + ?Sized> Releasable for Box<T> {
    fn release(&self) -> Result<(), ReleaseError> {
        (**self).release()
    }
}
