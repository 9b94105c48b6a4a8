//! In-memory storage backend.
//!
//! Provides [`InMemoryStore`], a thread-safe map of cache entries. This is
//! the default backend for a single process and for tests; entries do not
//! survive a restart.

use core::future::{self, Future};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{AffiliateError, Result};

use super::{CacheEntry, CacheStore};

/// Thread-safe in-memory cache store.
///
/// # Example
///
/// ```rust
/// use affiliate_catalog::cache::{CacheConfig, CacheService};
/// use affiliate_catalog::models::Catalog;
/// use affiliate_catalog::storage::InMemoryStore;
///
/// let cache = CacheService::new(InMemoryStore::<Catalog>::new(), CacheConfig::default());
/// # drop(cache);
/// ```
pub struct InMemoryStore<T> {
    /// Entries keyed by cache key, behind a single mutex.
    entries: Mutex<HashMap<String, CacheEntry<T>>>,
}

impl<T> InMemoryStore<T> {
    /// Creates a new empty store.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Number of stored entries.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.with_lock(|entries| entries.len()).unwrap_or(0)
    }

    /// Returns `true` when nothing is stored.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Acquires the inner lock and applies a closure.
    fn with_lock<R>(&self, f: impl FnOnce(&mut HashMap<String, CacheEntry<T>>) -> R) -> Result<R> {
        let mut entries = self.entries.lock().map_err(|err| lock_error(&err))?;
        Ok(f(&mut entries))
    }
}

impl<T> Default for InMemoryStore<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<T> core::fmt::Debug for InMemoryStore<T> {
    #[inline]
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("entries", &self.len())
            .finish()
    }
}

/// Wraps a mutex poison error.
fn lock_error<E>(err: &std::sync::PoisonError<E>) -> AffiliateError {
    AffiliateError::Storage(err.to_string().into())
}

impl<T> CacheStore<T> for InMemoryStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    #[inline]
    fn load(&self, key: &str) -> impl Future<Output = Result<Option<CacheEntry<T>>>> + Send {
        future::ready(self.with_lock(|entries| entries.get(key).cloned()))
    }

    #[inline]
    fn save(&self, key: &str, entry: CacheEntry<T>) -> impl Future<Output = Result<()>> + Send {
        future::ready(self.with_lock(|entries| {
            let _previous = entries.insert(key.to_owned(), entry);
        }))
    }

    #[inline]
    fn remove(&self, key: &str) -> impl Future<Output = Result<()>> + Send {
        future::ready(self.with_lock(|entries| {
            let _removed = entries.remove(key);
        }))
    }

    #[inline]
    fn clear(&self) -> impl Future<Output = Result<()>> + Send {
        future::ready(self.with_lock(HashMap::clear))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_missing_key_returns_none() {
        let store = InMemoryStore::<String>::new();
        assert!(store.load("nope").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn save_then_load() {
        let store = InMemoryStore::new();
        store
            .save("k", CacheEntry::new("1", "value".to_owned(), 42))
            .await
            .unwrap();
        let entry = store.load("k").await.unwrap().unwrap();
        assert_eq!(entry.data, "value");
        assert_eq!(entry.timestamp, 42);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn save_replaces_wholesale() {
        let store = InMemoryStore::new();
        store
            .save("k", CacheEntry::new("1", vec![1, 2, 3], 1))
            .await
            .unwrap();
        store
            .save("k", CacheEntry::new("2", vec![9], 2))
            .await
            .unwrap();
        let entry = store.load("k").await.unwrap().unwrap();
        assert_eq!(entry.version, "2");
        assert_eq!(entry.data, vec![9]);
    }

    #[tokio::test]
    async fn remove_and_clear() {
        let store = InMemoryStore::new();
        store.save("a", CacheEntry::new("1", 1_u8, 0)).await.unwrap();
        store.save("b", CacheEntry::new("1", 2_u8, 0)).await.unwrap();

        store.remove("a").await.unwrap();
        store.remove("missing").await.unwrap();
        assert!(store.load("a").await.unwrap().is_none());
        assert_eq!(store.len(), 1);

        store.clear().await.unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn debug_shows_entry_count() {
        let store = InMemoryStore::<u8>::new();
        assert_eq!(format!("{store:?}"), "InMemoryStore { entries: 0 }");
    }
}
