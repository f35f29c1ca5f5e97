// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! A typed-key cache whose lifetime is bound to a cancellable task scope.
//!
//! [`ScopedCache`] stores values computed on demand for some owning context, such as a device
//! connection, and releases them when that context goes away. It offers:
//!
//! - **Typed keys**: a [`Key<T>`] unlocks a value of type `T`, so one cache holds values of many
//!   types without casts at the call site.
//! - **At-most-once population**: the provider for a key runs at most once, even when many
//!   callers on many threads ask for the key at the same time.
//! - **Background population**: [`ScopedCache::get_or_put_async_fast`] hands out a cheap
//!   placeholder while the real value is computed on the owning [`Scope`], and serves the real
//!   value once it is ready.
//! - **Lifecycle binding**: when the owning scope is cancelled or closed, in-flight computations
//!   are cancelled and every [`Releasable`] value is released exactly once.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use scoped_cache::{Key, ScopedCache, Scope};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), scoped_cache::CacheError> {
//! let scope = Scope::new();
//! let cache = ScopedCache::new(&scope);
//!
//! let serial: Key<Arc<str>> = Key::new("serial number");
//! let value = cache.get_or_put(&serial, || Arc::from("emulator-5554"));
//! assert_eq!(&*value, "emulator-5554");
//!
//! let api_level: Key<u32> = Key::new("api level");
//! let level = cache
//!     .get_or_put_async(&api_level, || async { Ok::<_, std::io::Error>(34) })
//!     .await?;
//! assert_eq!(level, 34);
//!
//! scope.cancel();
//! assert!(cache.is_closed());
//! # Ok(())
//! # }
//! ```
//!
//! # Two namespaces
//!
//! The synchronous accessors ([`ScopedCache::get_or_put`], [`ScopedCache::try_get_or_put`]) and
//! the asynchronous ones ([`ScopedCache::get_or_put_async`],
//! [`ScopedCache::get_or_put_async_fast`]) keep separate slots. Using the same key with both
//! flavors yields two independent values.
//!
//! # Releasing values
//!
//! Values that own a resource implement [`Releasable`] and are stored under a key created with
//! [`Key::releasable`]. Values stored under other keys are simply dropped with the cache.

mod cache;
mod error;
mod key;
mod release;
mod scope;
mod slots;

pub use cache::{ScopedCache, ScopedCacheBuilder};
pub use error::{CacheError, CloseError, TaskError};
pub use key::Key;
pub use release::{ReleaseError, Releasable};
pub use scope::{Scope, ScopeBuilder, ScopedTask, Termination};
