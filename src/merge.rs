//! Deterministic merge of independently sourced catalogs.
//!
//! Categories are matched by normalized name, merchants by normalized
//! home page URL. Earlier catalogs take precedence: their category ids
//! and names, and their copy of a duplicated merchant, survive.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::models::{Catalog, Category, normalize_category_name};

/// Merges two optional catalogs using the current time.
///
/// See [`merge_at`] for the rules.
#[inline]
#[must_use]
pub fn merge(first: Option<&Catalog>, second: Option<&Catalog>) -> Catalog {
    merge_at(first, second, chrono::Utc::now().timestamp_millis())
}

/// Merges two optional catalogs as of `now_ms`.
///
/// - Both absent: an empty catalog stamped `now_ms`.
/// - Categories with the same normalized name are combined; the first
///   catalog's id and display name win.
/// - Within a category, merchants whose [`normalize_merchant_url`] keys
///   collide are deduplicated, first seen wins. Merchants whose key is
///   blank or not a valid host are dropped.
/// - Categories left without merchants are dropped.
/// - Categories are sorted by id ascending.
/// - `last_updated` is the maximum of the inputs and `now_ms`.
#[must_use]
#[inline]
pub fn merge_at(first: Option<&Catalog>, second: Option<&Catalog>, now_ms: i64) -> Catalog {
    merge_all([first, second].into_iter().flatten(), now_ms)
}

/// Merges any number of catalogs in iteration order as of `now_ms`.
#[must_use]
#[inline]
pub fn merge_all<'a, I>(catalogs: I, now_ms: i64) -> Catalog
where
    I: IntoIterator<Item = &'a Catalog>,
{
    let mut last_updated = now_ms;
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, MergedCategory> = HashMap::new();
    let mut inputs = 0_usize;

    for catalog in catalogs {
        inputs += 1;
        last_updated = last_updated.max(catalog.last_updated);
        for category in &catalog.categories {
            let name_key = normalize_category_name(&category.name);
            let group = groups.entry(name_key.clone()).or_insert_with(|| {
                order.push(name_key);
                MergedCategory::new(category)
            });
            group.absorb(category);
        }
    }

    let mut categories: Vec<Category> = order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .map(MergedCategory::into_category)
        .filter(|category| !category.merchants.is_empty())
        .collect();
    categories.sort_by_key(|category| category.id);

    debug!(
        inputs,
        categories = categories.len(),
        merchants = categories.iter().map(|c| c.merchants.len()).sum::<usize>(),
        "merged catalogs"
    );
    Catalog {
        categories,
        last_updated,
    }
}

/// Normalizes a merchant URL into its deduplication key: trimmed,
/// lower-cased, one trailing `/` removed, scheme and a leading `www.`
/// stripped.
#[must_use]
#[inline]
pub fn normalize_merchant_url(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let without_slash = lowered.strip_suffix('/').unwrap_or(&lowered);
    let without_scheme = without_slash
        .strip_prefix("https://")
        .or_else(|| without_slash.strip_prefix("http://"))
        .unwrap_or(without_slash);
    without_scheme
        .strip_prefix("www.")
        .unwrap_or(without_scheme)
        .to_owned()
}

/// Returns `true` when a normalized key still denotes a URL with a host.
fn is_valid_merchant_key(key: &str) -> bool {
    !key.is_empty()
        && url::Url::parse(&format!("https://{key}"))
            .is_ok_and(|parsed| parsed.host_str().is_some_and(|host| !host.is_empty()))
}

/// A category being assembled from several catalogs.
#[derive(Debug)]
struct MergedCategory {
    /// Output category; merchants appended as they are accepted.
    category: Category,
    /// Normalized URLs already accepted.
    seen: HashSet<String>,
}

impl MergedCategory {
    /// Starts a category from the first occurrence's id and name.
    fn new(first: &Category) -> Self {
        Self {
            category: Category {
                id: first.id,
                name: first.name.clone(),
                merchants: Vec::new(),
            },
            seen: HashSet::new(),
        }
    }

    /// Appends the merchants of `other` that are valid and not seen yet.
    fn absorb(&mut self, other: &Category) {
        for merchant in &other.merchants {
            let key = normalize_merchant_url(&merchant.clean_url);
            if !is_valid_merchant_key(&key) {
                debug!(merchant = %merchant.id, url = %merchant.clean_url, "dropping merchant without valid URL");
                continue;
            }
            if self.seen.insert(key) {
                let mut accepted = merchant.clone();
                accepted.category_id = self.category.id;
                self.category.merchants.push(accepted);
            }
        }
    }

    /// Finishes the category.
    fn into_category(self) -> Category {
        self.category
    }
}
