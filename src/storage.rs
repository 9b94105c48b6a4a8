//! Pluggable storage backends for cache entries.
//!
//! This module defines the [`CacheStore`] trait and the [`CacheEntry`]
//! envelope every backend persists. The store is deliberately dumb: it
//! reads and writes whole entries per key. Version checks, TTL, staleness
//! and request deduplication live in [`crate::cache::CacheService`].

mod entry;
#[cfg(feature = "storage-file")]
mod file;
mod memory;

use core::future::Future;

pub use entry::CacheEntry;
#[cfg(feature = "storage-file")]
pub use file::FileStore;
pub use memory::InMemoryStore;

use crate::error::Result;

/// Async storage backend for versioned cache entries of type `T`.
///
/// All methods take `&self`; implementations use interior mutability for
/// thread-safe mutation. Writes replace the entry for a key wholesale and
/// must be atomic per key. A failure on one key must not corrupt others.
pub trait CacheStore<T>: core::fmt::Debug + Send + Sync + 'static {
    /// Loads the raw entry stored under `key`, if any.
    ///
    /// No version or TTL checks are applied here.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage backend fails to read or decode
    /// the entry.
    fn load(&self, key: &str) -> impl Future<Output = Result<Option<CacheEntry<T>>>> + Send;

    /// Stores `entry` under `key`, replacing any previous entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage backend fails to write.
    fn save(&self, key: &str, entry: CacheEntry<T>) -> impl Future<Output = Result<()>> + Send;

    /// Removes the entry stored under `key`. Removing a missing key is
    /// not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage backend fails to write.
    fn remove(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Removes every stored entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage backend fails to write.
    fn clear(&self) -> impl Future<Output = Result<()>> + Send;
}
