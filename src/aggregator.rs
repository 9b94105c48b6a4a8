//! Request path: one merged catalog from every registered source.
//!
//! Each source is read stale-while-revalidate. A source whose read fails
//! falls back to whatever it has stored, valid or not, and a source with
//! nothing stored is left out. The request fails only when no source has
//! any data.

use futures::future::join_all;
use tracing::{info, warn};

use crate::cache::CacheService;
use crate::error::{AffiliateError, Result};
use crate::merge::merge_all;
use crate::models::Catalog;
use crate::source::SourceRegistration;
use crate::storage::CacheStore;

/// Serves merged catalogs from a [`CacheService`] and a set of sources.
///
/// Merge priority follows registration order: the first source's
/// categories and duplicate merchants win.
#[derive(Debug, Clone)]
pub struct CatalogAggregator<S> {
    /// Catalog cache shared with the scheduler.
    cache: CacheService<S, Catalog>,
    /// Sources in merge priority order.
    sources: Vec<SourceRegistration>,
}

impl<S> CatalogAggregator<S>
where
    S: CacheStore<Catalog>,
{
    /// Creates an aggregator over `cache` for `sources`.
    #[inline]
    #[must_use]
    pub const fn new(cache: CacheService<S, Catalog>, sources: Vec<SourceRegistration>) -> Self {
        Self { cache, sources }
    }

    /// The underlying cache.
    #[inline]
    #[must_use]
    pub const fn cache(&self) -> &CacheService<S, Catalog> {
        &self.cache
    }

    /// Registered sources in merge priority order.
    #[inline]
    #[must_use]
    pub fn sources(&self) -> &[SourceRegistration] {
        &self.sources
    }

    /// Reads every source in parallel and merges the results.
    ///
    /// # Errors
    ///
    /// Returns [`AffiliateError::NoDataAvailable`] when no source produced
    /// or has stored a catalog.
    #[tracing::instrument(skip_all)]
    #[inline]
    pub async fn merged_catalog(&self) -> Result<Catalog> {
        let catalogs = join_all(self.sources.iter().map(|source| self.read_source(source))).await;
        let available: Vec<&Catalog> = catalogs.iter().flatten().collect();
        if available.is_empty() {
            warn!("no source has catalog data");
            return Err(AffiliateError::NoDataAvailable);
        }
        Ok(merge_all(available, chrono::Utc::now().timestamp_millis()))
    }

    /// Reads one source, falling back to any stored value on failure.
    async fn read_source(&self, registration: &SourceRegistration) -> Option<Catalog> {
        let key = registration.key();
        let fetch = registration.fetch_fn();
        match self.cache.get_cached_or_fetch_stale(key, move || fetch()).await {
            Ok(catalog) => Some(catalog),
            Err(err) => {
                warn!(key, error = %err, "source read failed, falling back to stored catalog");
                self.cache.peek(key).await
            }
        }
    }

    /// Fetches every source that has no valid cached catalog, in
    /// parallel. Returns, per source key, whether a fetch ran.
    #[inline]
    pub async fn warmup_all(&self) -> Vec<(String, Result<bool>)> {
        let warmups = self.sources.iter().map(|registration| {
            let key = registration.key().to_owned();
            let fetch = registration.fetch_fn();
            async move {
                let outcome = self.cache.warmup(&key, move || fetch()).await;
                (key, outcome)
            }
        });
        let results = join_all(warmups).await;
        let fetched = results
            .iter()
            .filter(|&&(_, ref outcome)| matches!(*outcome, Ok(true)))
            .count();
        info!(sources = results.len(), fetched, "cache warm-up finished");
        results
    }
}
