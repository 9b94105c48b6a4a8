//! Upstream catalog sources.
//!
//! A [`CatalogSource`] fetches one affiliate network and produces a
//! validated [`Catalog`]. [`SourceRegistration`] erases a concrete source
//! into a cloneable fetch function bound to its cache key, which is what
//! the scheduler and the aggregator work with.

mod json_network;
mod xml_network;

use core::future::Future;
use std::collections::BTreeMap;
use std::sync::Arc;

use futures::FutureExt as _;
use futures::future::BoxFuture;
use tracing::info;

pub use json_network::{
    JsonNetworkSource, JsonNetworkSourceBuilder, ProgramsPayload, parse_json_payload,
};
pub use xml_network::{XmlNetworkSource, XmlNetworkSourceBuilder, parse_xml_feed};

use crate::error::Result;
use crate::models::{Catalog, Category, CategoryId, Merchant, Source, generate_category_id};

/// Boxed catalog fetch future.
pub type FetchFuture = BoxFuture<'static, Result<Catalog>>;

/// Type-erased, cloneable catalog fetch function.
pub type FetchFn = Arc<dyn Fn() -> FetchFuture + Send + Sync>;

/// An affiliate network that can produce a catalog.
pub trait CatalogSource: core::fmt::Debug + Send + Sync + 'static {
    /// Which network this is.
    fn kind(&self) -> Source;

    /// Fetches, validates and groups the network's programs.
    ///
    /// # Errors
    ///
    /// Returns an error if the upstream request fails after all retries
    /// or the payload is malformed at the top level.
    fn fetch(&self) -> impl Future<Output = Result<Catalog>> + Send;
}

/// A source bound to the cache key its catalog is stored under.
#[derive(Clone)]
pub struct SourceRegistration {
    /// Network the catalog comes from.
    source: Source,
    /// Cache key.
    key: String,
    /// Fetch function.
    fetch: FetchFn,
}

impl SourceRegistration {
    /// Registers a concrete source under its default cache key.
    #[must_use]
    #[inline]
    pub fn new<S: CatalogSource>(source: S) -> Self {
        let kind = source.kind();
        let shared = Arc::new(source);
        Self::from_fn(kind, move || {
            let source = Arc::clone(&shared);
            async move { source.fetch().await }.boxed()
        })
    }

    /// Registers an arbitrary fetch function for `source`.
    #[must_use]
    #[inline]
    pub fn from_fn<F>(source: Source, fetch: F) -> Self
    where
        F: Fn() -> FetchFuture + Send + Sync + 'static,
    {
        Self {
            source,
            key: source.cache_key().to_owned(),
            fetch: Arc::new(fetch),
        }
    }

    /// Overrides the cache key.
    #[inline]
    #[must_use]
    pub fn with_key<K: Into<String>>(mut self, key: K) -> Self {
        self.key = key.into();
        self
    }

    /// Network of this registration.
    #[inline]
    #[must_use]
    pub const fn source(&self) -> Source {
        self.source
    }

    /// Cache key of this registration.
    #[inline]
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns a handle to the fetch function.
    #[inline]
    #[must_use]
    pub fn fetch_fn(&self) -> FetchFn {
        Arc::clone(&self.fetch)
    }
}

impl core::fmt::Debug for SourceRegistration {
    #[inline]
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SourceRegistration")
            .field("source", &self.source)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Normalizes a merchant home page URL.
///
/// Trims whitespace and prepends `https://` to bare hosts. Returns `None`
/// unless the result is an absolute http(s) URL with a host.
#[must_use]
#[inline]
pub fn clean_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_owned()
    } else {
        format!("https://{trimmed}")
    };
    let parsed = url::Url::parse(&candidate).ok()?;
    let web_scheme = matches!(parsed.scheme(), "http" | "https");
    let has_host = parsed.host_str().is_some_and(|host| !host.is_empty());
    (web_scheme && has_host).then_some(candidate)
}

/// Per-batch record counts logged after parsing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
    /// Records turned into merchants.
    pub kept: usize,
    /// Records dropped because a required field was missing or invalid.
    pub invalid: usize,
    /// Records dropped by the approval/status filter.
    pub filtered: usize,
}

impl ParseStats {
    /// Logs the batch summary for `source`.
    pub(crate) fn log(self, source: Source) {
        info!(
            source = %source,
            kept = self.kept,
            invalid = self.invalid,
            filtered = self.filtered,
            "parsed upstream programs"
        );
    }
}

/// Groups merchants into categories keyed by derived category id.
#[derive(Debug, Default)]
pub(crate) struct CatalogBuilder {
    /// Categories by id; iteration order is the output order.
    categories: BTreeMap<CategoryId, Category>,
}

impl CatalogBuilder {
    /// Creates an empty builder.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Adds `merchant` to the category called `category_name`; the
    /// category's display name is the first spelling seen.
    pub(crate) fn push(&mut self, category_name: &str, mut merchant: Merchant) {
        let id = generate_category_id(category_name);
        merchant.category_id = id;
        self.categories
            .entry(id)
            .or_insert_with(|| Category {
                id,
                name: category_name.to_owned(),
                merchants: Vec::new(),
            })
            .merchants
            .push(merchant);
    }

    /// Finishes the catalog, categories sorted by id ascending.
    pub(crate) fn build(self, last_updated: i64) -> Catalog {
        Catalog {
            categories: self.categories.into_values().collect(),
            last_updated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MerchantId;

    fn merchant(id: &str) -> Merchant {
        Merchant {
            id: MerchantId::new(id.to_owned()),
            display_name: id.to_owned(),
            clean_url: format!("https://{id}.dk"),
            affiliate_url: format!("https://track.example/{id}"),
            category_id: CategoryId::new(0),
            status: "approved".to_owned(),
            source: Source::Xml,
        }
    }

    #[test]
    fn clean_url_accepts_and_normalizes() {
        assert_eq!(clean_url(" zalando.dk "), Some("https://zalando.dk".to_owned()));
        assert_eq!(clean_url("http://hm.com/dk"), Some("http://hm.com/dk".to_owned()));
        assert_eq!(clean_url(""), None);
        assert_eq!(clean_url("   "), None);
        assert_eq!(clean_url("ftp://files.example"), None);
        assert_eq!(clean_url("https://"), None);
        assert_eq!(clean_url("not a url"), None);
    }

    #[test]
    fn builder_groups_and_sorts_by_id() {
        let mut builder = CatalogBuilder::new();
        builder.push("Mode", merchant("a"));
        builder.push("Sko", merchant("b"));
        builder.push("mode", merchant("c"));
        let catalog = builder.build(5);

        assert_eq!(catalog.last_updated, 5);
        assert_eq!(catalog.categories.len(), 2);
        let ids: Vec<u32> = catalog.categories.iter().map(|c| c.id.into_inner()).collect();
        assert_eq!(ids, vec![505_874, 515_018]);

        let mode = catalog.category(generate_category_id("Mode")).unwrap();
        assert_eq!(mode.name, "Mode");
        assert_eq!(mode.merchants.len(), 2);
        assert!(mode.merchants.iter().all(|m| m.category_id == mode.id));
    }

    #[derive(Debug)]
    struct FixedSource;

    impl CatalogSource for FixedSource {
        fn kind(&self) -> Source {
            Source::Json
        }

        async fn fetch(&self) -> Result<Catalog> {
            Ok(Catalog::empty(42))
        }
    }

    #[tokio::test]
    async fn registration_erases_source() {
        let registration = SourceRegistration::new(FixedSource);
        assert_eq!(registration.source(), Source::Json);
        assert_eq!(registration.key(), "catalog:json");
        let fetch = registration.fetch_fn();
        assert_eq!(fetch().await.unwrap().last_updated, 42);

        let renamed = registration.with_key("custom");
        assert_eq!(renamed.key(), "custom");
        assert!(format!("{renamed:?}").contains("custom"));
    }
}
