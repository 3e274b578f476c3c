//! Keyed registry of shared values.
//!
//! Execution locks, cancellation tokens and semaphores are all looked up by
//! key and created on first use. A [`Registry`] owns one such family so that
//! each engine (and each test) gets its own instead of process-wide state.

use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;

/// A concurrent map of lazily created shared values.
pub struct Registry<T> {
    entries: DashMap<String, Arc<T>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<T> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").field("len", &self.len()).finish()
    }
}

impl<T> Registry<T> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value for `key`, creating it with `create` if absent.
    ///
    /// Creation happens under the shard lock for `key`, so concurrent
    /// callers always observe the same value.
    pub fn get_or_insert_with(&self, key: &str, create: impl FnOnce() -> T) -> Arc<T> {
        if let Some(existing) = self.entries.get(key) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.entries
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(create()))
                .value(),
        )
    }

    /// Returns the value for `key`, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.entries.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Removes `key`. Holders of the value keep it alive.
    pub fn release(&self, key: &str) -> Option<Arc<T>> {
        self.entries.remove(key).map(|(_, value)| value)
    }

    /// Removes every key matching `predicate` and returns how many were removed.
    pub fn release_matching(&self, predicate: impl Fn(&str) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !predicate(key));
        before.saturating_sub(self.entries.len())
    }

    /// Returns true if `key` is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: Default> Registry<T> {
    /// Returns the value for `key`, creating a default one if absent.
    pub fn get_or_create(&self, key: &str) -> Arc<T> {
        self.get_or_insert_with(key, T::default)
    }
}
