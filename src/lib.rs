//! Caching, staleness and merge core for aggregated affiliate merchant
//! catalogs.
//!
//! Two affiliate networks publish merchant programs, one as an XML feed
//! and one as a JSON API. This crate fetches both, normalizes them into
//! [`models::Catalog`]s grouped by name-derived category ids, caches each
//! source's catalog with TTL, versioning and stale-while-revalidate, and
//! merges them into one deduplicated catalog on request.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use affiliate_catalog::aggregator::CatalogAggregator;
//! use affiliate_catalog::cache::CacheService;
//! use affiliate_catalog::config::Config;
//! use affiliate_catalog::storage::InMemoryStore;
//!
//! # async fn example() -> affiliate_catalog::error::Result<()> {
//! let config = Config::from_env()?;
//! let cache = CacheService::new(InMemoryStore::new(), config.cache.clone());
//! let aggregator = CatalogAggregator::new(cache, config.registrations()?);
//!
//! let catalog = aggregator.merged_catalog().await?;
//! println!("{} merchants", catalog.merchant_count());
//! # Ok(())
//! # }
//! ```
//!
//! # Layout
//!
//! - [`source`]: the two network fetchers and the [`source::CatalogSource`]
//!   seam.
//! - [`merge`]: URL-based merchant deduplication across catalogs.
//! - [`storage`]: the [`storage::CacheStore`] trait with in-memory and
//!   file backends.
//! - [`cache`]: [`cache::CacheService`] with deduplicated fetches, refresh
//!   locks and metrics.
//! - [`scheduler`]: daily refresh with capped retries.
//! - [`aggregator`]: the request path.

pub mod aggregator;
pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod merge;
pub mod models;
pub mod scheduler;
pub mod source;
pub mod storage;
