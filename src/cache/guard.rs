//! RAII guards for per-key cache bookkeeping.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

/// Per-key refresh mutex. Held for the whole duration of a refresh and
/// released on drop, whichever way the refresh ends.
#[derive(Debug)]
pub(crate) struct RefreshLock {
    /// Set of keys currently being refreshed.
    held: Arc<Mutex<HashSet<String>>>,
    /// Key this guard owns.
    key: String,
}

impl RefreshLock {
    /// Takes the lock for `key` unless another refresh holds it.
    pub(crate) fn try_acquire(held: &Arc<Mutex<HashSet<String>>>, key: &str) -> Option<Self> {
        let inserted = held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned());
        inserted.then(|| Self {
            held: Arc::clone(held),
            key: key.to_owned(),
        })
    }
}

impl Drop for RefreshLock {
    fn drop(&mut self) {
        let _released = self
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Removes a key's in-flight marker when the fetch task finishes, is
/// cancelled or panics.
#[derive(Debug)]
pub(crate) struct InFlightGuard<'map, V> {
    /// In-flight map the marker lives in.
    map: &'map Mutex<HashMap<String, V>>,
    /// Key of the marker.
    key: &'map str,
}

impl<'map, V> InFlightGuard<'map, V> {
    /// Arms the guard for `key`.
    pub(crate) const fn new(map: &'map Mutex<HashMap<String, V>>, key: &'map str) -> Self {
        Self { map, key }
    }
}

impl<V> Drop for InFlightGuard<'_, V> {
    fn drop(&mut self) {
        let _removed = self
            .map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(self.key);
    }
}
