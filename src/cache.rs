//! Versioned TTL cache with request deduplication and
//! stale-while-revalidate reads.
//!
//! [`CacheService`] sits between callers and a [`CacheStore`]. It adds:
//!
//! - version and TTL checks on read,
//! - at most one upstream fetch in flight per key, shared by every
//!   concurrent caller,
//! - a per-key refresh mutex so refreshes never overlap,
//! - a stale read path that answers immediately and refreshes in the
//!   background,
//! - [`CacheMetrics`] counters.
//!
//! Fetches run as spawned tasks. A caller that stops waiting does not
//! cancel the fetch, and the in-flight marker is removed on every exit
//! path of the task.

mod guard;
mod metrics;

use core::future::Future;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::{FutureExt as _, TryFutureExt as _};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub use metrics::{CacheMetrics, FETCH_DURATION_WINDOW};

use self::guard::{InFlightGuard, RefreshLock};
use crate::error::{AffiliateError, Result};
use crate::storage::{CacheEntry, CacheStore};

/// Cache schema version written into every entry. Bumping it makes every
/// previously stored entry a miss.
pub const CACHE_VERSION: &str = "1";

/// Default time-to-live of an entry.
const DEFAULT_TTL: Duration = Duration::from_secs(48 * 60 * 60);

/// Default age after which an entry is refreshed in the background.
const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Default interval between refresh-lock polls.
const DEFAULT_LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default upper bound on waiting for another refresh.
const DEFAULT_LOCK_WAIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Result type of a shared fetch; errors are reference-counted so every
/// waiter can receive them.
type SharedResult<T> = core::result::Result<T, Arc<AffiliateError>>;

/// A fetch that several callers may await.
type SharedFetch<T> = Shared<BoxFuture<'static, SharedResult<T>>>;

/// Tuning knobs for [`CacheService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Version stamped on written entries and required on read.
    pub version: String,
    /// Entries older than this are misses.
    pub ttl: Duration,
    /// Entries older than this are served stale and refreshed.
    pub stale_after: Duration,
    /// How often a blocked refresh checks whether the lock was released.
    pub lock_poll_interval: Duration,
    /// How long a blocked refresh waits before giving up.
    pub lock_wait_timeout: Duration,
}

impl Default for CacheConfig {
    #[inline]
    fn default() -> Self {
        Self {
            version: CACHE_VERSION.to_owned(),
            ttl: DEFAULT_TTL,
            stale_after: DEFAULT_STALE_AFTER,
            lock_poll_interval: DEFAULT_LOCK_POLL_INTERVAL,
            lock_wait_timeout: DEFAULT_LOCK_WAIT_TIMEOUT,
        }
    }
}

/// Freshness of the entry stored under a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Nothing usable is stored (missing or written under another version).
    Empty,
    /// Younger than the staleness threshold.
    Fresh,
    /// Older than the staleness threshold but within the TTL.
    Stale,
    /// Older than the TTL.
    Expired,
}

impl CacheState {
    /// Lower-case label.
    #[inline]
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Fresh => "fresh",
            Self::Stale => "stale",
            Self::Expired => "expired",
        }
    }
}

impl core::fmt::Display for CacheState {
    #[inline]
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.label())
    }
}

/// Shared state behind every clone of a [`CacheService`].
struct Inner<S, T> {
    /// Backing store.
    store: S,
    /// Configuration.
    config: CacheConfig,
    /// Fetches currently running, by key.
    in_flight: Mutex<HashMap<String, SharedFetch<T>>>,
    /// Keys currently being refreshed.
    refresh_locks: Arc<Mutex<HashSet<String>>>,
    /// Counters.
    metrics: Mutex<CacheMetrics>,
}

/// Cache service over a [`CacheStore`].
///
/// Cloning is cheap; clones share the store, in-flight fetches, refresh
/// locks and metrics.
pub struct CacheService<S, T> {
    /// Shared state.
    inner: Arc<Inner<S, T>>,
}

impl<S, T> Clone for CacheService<S, T> {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: core::fmt::Debug, T> core::fmt::Debug for CacheService<S, T> {
    #[inline]
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CacheService")
            .field("store", &self.inner.store)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

/// Current wall-clock time in Unix milliseconds.
fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Recovers the error of a shared fetch, unwrapping it when this caller
/// is its only holder.
fn unshare(err: Arc<AffiliateError>) -> AffiliateError {
    Arc::try_unwrap(err).unwrap_or_else(AffiliateError::Shared)
}

impl<S, T> CacheService<S, T>
where
    S: CacheStore<T>,
    T: Clone + Send + Sync + 'static,
{
    /// Creates a service over `store`.
    #[inline]
    #[must_use]
    pub fn new(store: S, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                in_flight: Mutex::new(HashMap::new()),
                refresh_locks: Arc::new(Mutex::new(HashSet::new())),
                metrics: Mutex::new(CacheMetrics::default()),
            }),
        }
    }

    /// Configuration in use.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Backing store.
    #[inline]
    #[must_use]
    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Applies `update` to the metrics.
    fn record<R>(&self, update: impl FnOnce(&mut CacheMetrics) -> R) -> R {
        let mut metrics = self
            .inner
            .metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        update(&mut metrics)
    }

    /// Loads the raw entry for `key`, logging and swallowing store errors.
    async fn load_entry(&self, key: &str) -> Option<CacheEntry<T>> {
        match self.inner.store.load(key).await {
            Ok(entry) => entry,
            Err(err) => {
                warn!(key, error = %err, "cache store read failed");
                None
            }
        }
    }

    /// Returns the cached value if it was written under the current
    /// version and is within its TTL.
    ///
    /// Expired entries are reported as a miss but left in the store, where
    /// they remain the [`peek`](Self::peek) fallback until a fetch
    /// replaces them. Store failures are logged and reported as a miss.
    #[inline]
    pub async fn get(&self, key: &str) -> Option<T> {
        let entry = self.load_entry(key).await?;
        if entry.version != self.inner.config.version {
            debug!(key, stored = %entry.version, current = %self.inner.config.version, "cache version mismatch");
            return None;
        }
        if entry.is_expired(now_ms(), self.inner.config.ttl) {
            debug!(key, "cache entry expired");
            return None;
        }
        Some(entry.data)
    }

    /// Returns whatever value is stored under `key`, ignoring version and
    /// TTL. Used as the last fallback when a fetch fails.
    #[inline]
    pub async fn peek(&self, key: &str) -> Option<T> {
        self.load_entry(key).await.map(|entry| entry.data)
    }

    /// Stores `data` under `key` with the current version and time,
    /// replacing any previous entry. `ttl` overrides the default TTL.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails to write.
    #[inline]
    pub async fn set(&self, key: &str, data: T, ttl: Option<Duration>) -> Result<()> {
        let entry =
            CacheEntry::new(self.inner.config.version.as_str(), data, now_ms()).with_ttl(ttl);
        self.inner.store.save(key, entry).await
    }

    /// Freshness of the entry stored under `key`.
    #[inline]
    pub async fn state(&self, key: &str) -> CacheState {
        let Some(entry) = self.load_entry(key).await else {
            return CacheState::Empty;
        };
        let now = now_ms();
        if entry.version != self.inner.config.version {
            CacheState::Empty
        } else if entry.is_expired(now, self.inner.config.ttl) {
            CacheState::Expired
        } else if entry.is_stale(now, self.inner.config.stale_after) {
            CacheState::Stale
        } else {
            CacheState::Fresh
        }
    }

    /// Returns the cached value, or fetches, stores and returns a fresh
    /// one.
    ///
    /// Concurrent callers for the same key share a single fetch.
    ///
    /// # Errors
    ///
    /// Returns the fetch error when nothing valid is cached and the fetch
    /// fails. Callers that joined another caller's fetch receive
    /// [`AffiliateError::Shared`].
    #[tracing::instrument(skip_all, fields(key = %key))]
    #[inline]
    pub async fn get_cached_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if let Some(pending) = self.pending_fetch(key) {
            debug!("joining in-flight fetch");
            return pending.await.map_err(unshare);
        }
        if let Some(value) = self.get(key).await {
            debug!("cache hit");
            self.record(|metrics| metrics.hits += 1);
            return Ok(value);
        }
        debug!("cache miss");
        self.record(|metrics| metrics.misses += 1);
        self.start_or_join(key, fetch).await.map_err(unshare)
    }

    /// Stale-while-revalidate read.
    ///
    /// When the stored entry is older than the staleness threshold it is
    /// returned immediately (version and TTL are not checked) and a single
    /// background refresh is started. Otherwise behaves like
    /// [`get_cached_or_fetch`](Self::get_cached_or_fetch).
    ///
    /// # Errors
    ///
    /// Only errors from the non-stale path; background refresh failures
    /// are logged and counted.
    #[tracing::instrument(skip_all, fields(key = %key))]
    #[inline]
    pub async fn get_cached_or_fetch_stale<F, Fut>(&self, key: &str, fetch: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if let Some(entry) = self.load_entry(key).await
            && entry.is_stale(now_ms(), self.inner.config.stale_after)
        {
            debug!("serving stale value");
            self.record(|metrics| metrics.stale_serves += 1);
            self.spawn_background_refresh(key, fetch);
            return Ok(entry.data);
        }
        self.get_cached_or_fetch(key, fetch).await
    }

    /// Refreshes `key` now, bypassing any cached value.
    ///
    /// If another refresh of the key is running, waits for it to finish
    /// and returns what it cached instead of fetching again.
    ///
    /// # Errors
    ///
    /// Returns the fetch error, [`AffiliateError::RefreshLockTimeout`] if
    /// the other refresh does not finish within
    /// [`CacheConfig::lock_wait_timeout`], or
    /// [`AffiliateError::NotCached`] if it finished without caching a
    /// value.
    #[tracing::instrument(skip_all, fields(key = %key))]
    #[inline]
    pub async fn force_refresh<F, Fut>(&self, key: &str, fetch: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if let Some(_lock) = RefreshLock::try_acquire(&self.inner.refresh_locks, key) {
            return self.refresh_locked(key, fetch).await;
        }

        debug!("refresh already running, waiting for it");
        let deadline = Instant::now() + self.inner.config.lock_wait_timeout;
        while self.is_refreshing(key) {
            if Instant::now() >= deadline {
                return Err(AffiliateError::RefreshLockTimeout {
                    key: key.to_owned(),
                });
            }
            tokio::time::sleep(self.inner.config.lock_poll_interval).await;
        }
        self.get(key).await.ok_or_else(|| AffiliateError::NotCached {
            key: key.to_owned(),
        })
    }

    /// Fetches `key` only when nothing valid is cached. Returns whether a
    /// fetch ran.
    ///
    /// # Errors
    ///
    /// Returns the fetch error.
    #[inline]
    pub async fn warmup<F, Fut>(&self, key: &str, fetch: F) -> Result<bool>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if self.get(key).await.is_some() {
            debug!(key, "warm-up skipped, cache is valid");
            return Ok(false);
        }
        let _value = self.start_or_join(key, fetch).await.map_err(unshare)?;
        info!(key, "cache warmed up");
        Ok(true)
    }

    /// Reads several keys in parallel; results are in `keys` order.
    #[inline]
    pub async fn get_cached_batch<K: AsRef<str>>(&self, keys: &[K]) -> Vec<Option<T>> {
        futures::future::join_all(keys.iter().map(|key| self.get(key.as_ref()))).await
    }

    /// Writes several entries in parallel. Writes are independent: a
    /// failure leaves the other keys written or not in any combination.
    ///
    /// # Errors
    ///
    /// Returns the first store error.
    #[inline]
    pub async fn set_cache_batch<I>(&self, entries: I, ttl: Option<Duration>) -> Result<()>
    where
        I: IntoIterator<Item = (String, T)>,
    {
        let writes = entries
            .into_iter()
            .map(|(key, data)| async move { self.set(&key, data, ttl).await });
        let _written = futures::future::try_join_all(writes).await?;
        Ok(())
    }

    /// Removes the entry stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails to write.
    #[inline]
    pub async fn clear(&self, key: &str) -> Result<()> {
        self.inner.store.remove(key).await
    }

    /// Removes every stored entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails to write.
    #[inline]
    pub async fn clear_all(&self) -> Result<()> {
        self.inner.store.clear().await
    }

    /// Snapshot of the counters.
    #[inline]
    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        self.record(|metrics| metrics.clone())
    }

    /// Resets every counter.
    #[inline]
    pub fn reset_metrics(&self) {
        self.record(|metrics| *metrics = CacheMetrics::default());
    }

    /// Returns `true` while a refresh of `key` holds the refresh lock.
    #[inline]
    #[must_use]
    pub fn is_refreshing(&self, key: &str) -> bool {
        self.inner
            .refresh_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }

    /// Returns the running fetch for `key`, if any.
    fn pending_fetch(&self, key: &str) -> Option<SharedFetch<T>> {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Joins the running fetch for `key` or starts a new one.
    ///
    /// The check and the insert happen under one lock acquisition, so two
    /// callers can never both start a fetch.
    fn start_or_join<F, Fut>(&self, key: &str, fetch: F) -> SharedFetch<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut in_flight = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(pending) = in_flight.get(key) {
            return pending.clone();
        }

        let service = self.clone();
        let owned_key = key.to_owned();
        let task = tokio::spawn(async move { service.run_fetch(&owned_key, fetch).await });
        let shared = task
            .unwrap_or_else(|join_err| Err(Arc::new(AffiliateError::Task(join_err.to_string()))))
            .boxed()
            .shared();
        let _previous = in_flight.insert(key.to_owned(), shared.clone());
        shared
    }

    /// Body of a fetch task: fetch, time, store, count.
    async fn run_fetch<F, Fut>(&self, key: &str, fetch: F) -> SharedResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _marker = InFlightGuard::new(&self.inner.in_flight, key);
        let started = Instant::now();
        let outcome = fetch().await;
        let elapsed = started.elapsed();
        self.record(|metrics| metrics.record_fetch_duration(key, elapsed));

        match outcome {
            Ok(data) => {
                if let Err(err) = self.set(key, data.clone(), None).await {
                    warn!(key, error = %err, "failed to store fetched value");
                }
                debug!(
                    key,
                    elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    "fetched and cached"
                );
                Ok(data)
            }
            Err(err) => {
                self.record(|metrics| metrics.errors += 1);
                warn!(key, error = %err, "upstream fetch failed");
                Err(Arc::new(err))
            }
        }
    }

    /// Runs a refresh while the caller holds the key's refresh lock.
    async fn refresh_locked<F, Fut>(&self, key: &str, fetch: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let data = self.start_or_join(key, fetch).await.map_err(unshare)?;
        self.record(|metrics| {
            metrics.refreshes += 1;
            let _previous = metrics
                .last_refresh
                .insert(key.to_owned(), chrono::Utc::now());
        });
        info!(key, "cache refreshed");
        Ok(data)
    }

    /// Starts a background refresh of `key` unless one is running.
    fn spawn_background_refresh<F, Fut>(&self, key: &str, fetch: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let Some(lock) = RefreshLock::try_acquire(&self.inner.refresh_locks, key) else {
            debug!(key, "background refresh already running");
            return;
        };
        let service = self.clone();
        let owned_key = key.to_owned();
        let _task = tokio::spawn(async move {
            let _lock = lock;
            if let Err(err) = service.refresh_locked(&owned_key, fetch).await {
                error!(key = %owned_key, error = %err, "background refresh failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::storage::InMemoryStore;

    type TestCache = CacheService<InMemoryStore<String>, String>;

    const HOUR_MS: i64 = 3_600_000;

    fn cache() -> TestCache {
        CacheService::new(InMemoryStore::new(), CacheConfig::default())
    }

    /// Fetch closure returning `value` and counting its invocations.
    fn counted(
        calls: &Arc<AtomicU32>,
        value: &str,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<String>> + Send + 'static {
        let calls = Arc::clone(calls);
        let value = value.to_owned();
        move || {
            async move {
                let _previous = calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(value)
            }
            .boxed()
        }
    }

    fn failing() -> impl FnOnce() -> BoxFuture<'static, Result<String>> + Send + 'static {
        || async { Err::<String, _>(AffiliateError::EmptyResponse) }.boxed()
    }

    async fn store_aged(cache: &TestCache, key: &str, value: &str, age_hours: i64) {
        let entry = CacheEntry::new(CACHE_VERSION, value.to_owned(), now_ms() - age_hours * HOUR_MS);
        cache.store().save(key, entry).await.unwrap();
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let cache = cache();
        let calls = Arc::new(AtomicU32::new(0));

        let first = cache.get_cached_or_fetch("k", counted(&calls, "v1")).await.unwrap();
        let second = cache.get_cached_or_fetch("k", counted(&calls, "v2")).await.unwrap();

        assert_eq!(first, "v1");
        assert_eq!(second, "v1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let metrics = cache.metrics();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.fetch_durations["k"].len(), 1);
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_fetch() {
        let cache = cache();
        let calls = Arc::new(AtomicU32::new(0));

        let (a, b, c) = tokio::join!(
            cache.get_cached_or_fetch("k", counted(&calls, "a")),
            cache.get_cached_or_fetch("k", counted(&calls, "b")),
            cache.get_cached_or_fetch("k", counted(&calls, "c")),
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap(), "a");
        assert_eq!(b.unwrap(), "a");
        assert_eq!(c.unwrap(), "a");
        assert!(cache.pending_fetch("k").is_none());
    }

    #[tokio::test]
    async fn failed_fetch_clears_marker_and_counts_error() {
        let cache = cache();
        let result = cache.get_cached_or_fetch("k", failing()).await;
        assert!(matches!(result, Err(AffiliateError::EmptyResponse)));
        assert!(cache.pending_fetch("k").is_none());
        assert_eq!(cache.metrics().errors, 1);

        let calls = Arc::new(AtomicU32::new(0));
        let retry = cache.get_cached_or_fetch("k", counted(&calls, "ok")).await;
        assert_eq!(retry.unwrap(), "ok");
    }

    #[tokio::test]
    async fn dropped_caller_does_not_cancel_fetch() {
        let cache = cache();
        let calls = Arc::new(AtomicU32::new(0));

        let abandoned = tokio::time::timeout(
            Duration::from_millis(5),
            cache.get_cached_or_fetch("k", counted(&calls, "v")),
        )
        .await;
        assert!(abandoned.is_err());

        let value = cache.get_cached_or_fetch("k", counted(&calls, "other")).await.unwrap();
        assert_eq!(value, "v");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn old_version_is_a_miss() {
        let cache = cache();
        let entry = CacheEntry::new("0", "old".to_owned(), now_ms());
        cache.store().save("k", entry).await.unwrap();

        assert_eq!(cache.get("k").await, None);
        assert_eq!(cache.state("k").await, CacheState::Empty);
        assert_eq!(cache.peek("k").await.as_deref(), Some("old"));
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss_but_kept_for_fallback() {
        let cache = cache();
        store_aged(&cache, "k", "v", 49).await;
        assert_eq!(cache.state("k").await, CacheState::Expired);
        assert_eq!(cache.get("k").await, None);
        assert_eq!(cache.peek("k").await.as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn failed_warmup_keeps_expired_entry() {
        let cache = cache();
        store_aged(&cache, "k", "old", 49).await;
        let result = cache.warmup("k", failing()).await;
        assert!(matches!(result, Err(AffiliateError::EmptyResponse)));
        assert_eq!(cache.peek("k").await.as_deref(), Some("old"));
    }

    #[tokio::test]
    async fn per_entry_ttl_overrides_default() {
        let cache = cache();
        cache
            .set("k", "v".to_owned(), Some(Duration::from_millis(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn states_follow_age() {
        let cache = cache();
        assert_eq!(cache.state("k").await, CacheState::Empty);
        store_aged(&cache, "k", "v", 1).await;
        assert_eq!(cache.state("k").await, CacheState::Fresh);
        store_aged(&cache, "k", "v", 25).await;
        assert_eq!(cache.state("k").await, CacheState::Stale);
    }

    #[tokio::test]
    async fn stale_value_served_with_single_background_refresh() {
        let cache = cache();
        store_aged(&cache, "k", "stale", 25).await;
        let calls = Arc::new(AtomicU32::new(0));

        let (a, b) = tokio::join!(
            cache.get_cached_or_fetch_stale("k", counted(&calls, "fresh")),
            cache.get_cached_or_fetch_stale("k", counted(&calls, "fresh")),
        );
        assert_eq!(a.unwrap(), "stale");
        assert_eq!(b.unwrap(), "stale");
        assert!(cache.is_refreshing("k"));

        while cache.is_refreshing("k") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get("k").await.as_deref(), Some("fresh"));
        let metrics = cache.metrics();
        assert_eq!(metrics.stale_serves, 2);
        assert_eq!(metrics.refreshes, 1);
        assert!(metrics.last_refresh.contains_key("k"));
    }

    #[tokio::test]
    async fn background_refresh_failure_is_not_surfaced() {
        let cache = cache();
        store_aged(&cache, "k", "stale", 30).await;

        let value = cache.get_cached_or_fetch_stale("k", failing()).await.unwrap();
        assert_eq!(value, "stale");
        while cache.is_refreshing("k") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(cache.metrics().errors, 1);
        assert_eq!(cache.peek("k").await.as_deref(), Some("stale"));
    }

    #[tokio::test]
    async fn fresh_value_skips_refresh() {
        let cache = cache();
        store_aged(&cache, "k", "fresh", 2).await;
        let calls = Arc::new(AtomicU32::new(0));
        let value = cache
            .get_cached_or_fetch_stale("k", counted(&calls, "new"))
            .await
            .unwrap();
        assert_eq!(value, "fresh");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(cache.metrics().hits, 1);
    }

    #[tokio::test]
    async fn force_refresh_replaces_value() {
        let cache = cache();
        cache.set("k", "old".to_owned(), None).await.unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        let value = cache.force_refresh("k", counted(&calls, "new")).await.unwrap();
        assert_eq!(value, "new");
        assert_eq!(cache.get("k").await.as_deref(), Some("new"));
        assert!(!cache.is_refreshing("k"));
        assert_eq!(cache.metrics().refreshes, 1);
    }

    #[tokio::test]
    async fn concurrent_force_refresh_waits_for_holder() {
        let cache = cache();
        let calls = Arc::new(AtomicU32::new(0));

        let (a, b) = tokio::join!(
            cache.force_refresh("k", counted(&calls, "first")),
            async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                cache.force_refresh("k", counted(&calls, "second")).await
            },
        );
        assert_eq!(a.unwrap(), "first");
        assert_eq!(b.unwrap(), "first");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_force_refresh_releases_lock() {
        let cache = cache();
        let result = cache.force_refresh("k", failing()).await;
        assert!(result.is_err());
        assert!(!cache.is_refreshing("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_for_refresh_lock_times_out() {
        let config = CacheConfig {
            lock_wait_timeout: Duration::from_secs(1),
            ..CacheConfig::default()
        };
        let cache: TestCache = CacheService::new(InMemoryStore::new(), config);
        let _held = RefreshLock::try_acquire(&cache.inner.refresh_locks, "k").unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let result = cache.force_refresh("k", counted(&calls, "v")).await;
        assert!(matches!(result, Err(AffiliateError::RefreshLockTimeout { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn warmup_only_fetches_when_needed() {
        let cache = cache();
        let calls = Arc::new(AtomicU32::new(0));
        assert!(cache.warmup("k", counted(&calls, "v")).await.unwrap());
        assert!(!cache.warmup("k", counted(&calls, "v")).await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn batch_operations() {
        let cache = cache();
        cache
            .set_cache_batch(
                vec![("a".to_owned(), "1".to_owned()), ("b".to_owned(), "2".to_owned())],
                None,
            )
            .await
            .unwrap();
        let values = cache.get_cached_batch(&["a", "missing", "b"]).await;
        assert_eq!(values, vec![Some("1".to_owned()), None, Some("2".to_owned())]);

        cache.clear("a").await.unwrap();
        assert_eq!(cache.get("a").await, None);
        cache.clear_all().await.unwrap();
        assert_eq!(cache.get("b").await, None);
    }

    #[tokio::test]
    async fn reset_metrics_zeroes_counters() {
        let cache = cache();
        let calls = Arc::new(AtomicU32::new(0));
        let _value = cache.get_cached_or_fetch("k", counted(&calls, "v")).await.unwrap();
        assert_ne!(cache.metrics(), CacheMetrics::default());
        cache.reset_metrics();
        assert_eq!(cache.metrics(), CacheMetrics::default());
    }
}
