// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Typed cache keys.

use std::{
    any::TypeId,
    borrow::Cow,
    fmt,
    hash::{Hash, Hasher},
    marker::PhantomData,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::release::{ReleaseError, Releasable};

static NEXT_UNIQUE_ID: AtomicU64 = AtomicU64::new(0);

pub(crate) type ReleaseFn<T> = fn(&T) -> Result<(), ReleaseError>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum KeyId {
    Unique(u64),
    Named(Cow<'static, str>),
}

/// Identifies one cached value of type `T`.
///
/// Two keys address the same slot when they compare equal. The label is only used for
/// diagnostics and never takes part in equality.
///
/// - [`Key::new`] creates a key that is equal only to itself and its clones.
/// - [`Key::named`] creates a key that is equal to every other named key of the same value type
///   with the same name.
///
/// # Example
///
/// ```
/// use scoped_cache::Key;
///
/// let a: Key<String> = Key::new("properties");
/// let b: Key<String> = Key::new("properties");
/// assert_ne!(a, b);
/// assert_eq!(a, a.clone());
///
/// let c: Key<String> = Key::named("features");
/// let d: Key<String> = Key::named("features");
/// assert_eq!(c, d);
/// ```
pub struct Key<T> {
    id: KeyId,
    label: Cow<'static, str>,
    release: Option<ReleaseFn<T>>,
    _value: PhantomData<fn() -> T>,
}

impl<T> Key<T> {
    /// Creates a key that is distinct from every other key.
    ///
    /// Values stored under the key are not released when the cache closes, even if their type
    /// implements [`Releasable`]. Call [`Key::releasable`] for values that own a resource.
    #[must_use]
    pub fn new(label: impl Into<Cow<'static, str>>) -> Self {
        Self {
            id: KeyId::Unique(NEXT_UNIQUE_ID.fetch_add(1, Ordering::Relaxed)),
            label: label.into(),
            release: None,
            _value: PhantomData,
        }
    }

    /// Creates a key identified by `name`, which also serves as its label.
    ///
    /// Values stored under the key are not released when the cache closes, even if their type
    /// implements [`Releasable`]. Call [`Key::releasable`] for values that own a resource.
    #[must_use]
    pub fn named(name: impl Into<Cow<'static, str>>) -> Self {
        let name = name.into();
        Self {
            id: KeyId::Named(name.clone()),
            label: name,
            release: None,
            _value: PhantomData,
        }
    }

    /// Marks values stored under this key as owning a resource.
    ///
    /// When the cache closes, every value stored through a releasable key is released with
    /// [`Releasable::release`] exactly once.
    #[must_use]
    pub fn releasable(mut self) -> Self
    where
        T: Releasable,
    {
        self.release = Some(<T as Releasable>::release);
        self
    }

    /// Returns the diagnostic label of this key.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns `true` if values stored under this key are released when the cache closes.
    #[must_use]
    pub fn is_releasable(&self) -> bool {
        self.release.is_some()
    }

    pub(crate) fn label_cow(&self) -> Cow<'static, str> {
        self.label.clone()
    }

    pub(crate) fn release_fn(&self) -> Option<ReleaseFn<T>> {
        self.release
    }
}

impl<T: 'static> Key<T> {
    pub(crate) fn slot_key(&self) -> SlotKey {
        SlotKey {
            type_id: TypeId::of::<T>(),
            id: self.id.clone(),
        }
    }
}

impl<T> Clone for Key<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            label: self.label.clone(),
            release: self.release,
            _value: PhantomData,
        }
    }
}

impl<T> PartialEq for Key<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Key<T> {}

impl<T> Hash for Key<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("label", &self.label)
            .field("releasable", &self.release.is_some())
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

/// Map key of one slot: the value type plus the key identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct SlotKey {
    type_id: TypeId,
    id: KeyId,
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc};

    use super::*;

    #[derive(Debug)]
    struct Handle;

    impl Releasable for Handle {
        fn release(&self) -> Result<(), ReleaseError> {
            Ok(())
        }
    }

    #[test]
    fn unique_keys_with_same_label_differ() {
        let a: Key<u32> = Key::new("same");
        let b: Key<u32> = Key::new("same");
        assert_ne!(a, b);
        assert_ne!(a.slot_key(), b.slot_key());
    }

    #[test]
    fn clone_preserves_identity() {
        let a: Key<u32> = Key::new("a");
        let b = a.clone();
        assert_eq!(a, b);
        assert_eq!(a.slot_key(), b.slot_key());
    }

    #[test]
    fn named_keys_compare_by_name() {
        let a: Key<u32> = Key::named("features");
        let b: Key<u32> = Key::named(String::from("features"));
        let c: Key<u32> = Key::named("properties");
        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn same_name_different_type_is_a_different_slot() {
        let a: Key<u32> = Key::named("x");
        let b: Key<String> = Key::named("x");
        assert_ne!(a.slot_key(), b.slot_key());
    }

    #[test]
    fn releasable_does_not_change_identity() {
        let plain: Key<Arc<Handle>> = Key::named("conn");
        let releasing = plain.clone().releasable();
        assert!(!plain.is_releasable());
        assert!(releasing.is_releasable());
        assert_eq!(plain, releasing);
    }

    #[test]
    fn display_and_debug_show_label() {
        let key: Key<u32> = Key::new("device properties");
        assert_eq!(key.to_string(), "device properties");
        assert_eq!(key.label(), "device properties");
        assert!(format!("{key:?}").contains("device properties"));
    }
}
