//! Catalog model.

use serde::{Deserialize, Serialize};

use super::{Category, CategoryId};

/// The full categorized merchant dataset of one source, or of several
/// sources after merging.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Catalog {
    /// Categories sorted by id ascending.
    pub categories: Vec<Category>,
    /// Unix timestamp in milliseconds of the data this catalog reflects.
    pub last_updated: i64,
}

impl Catalog {
    /// Creates an empty catalog stamped with `last_updated`.
    #[inline]
    #[must_use]
    pub const fn empty(last_updated: i64) -> Self {
        Self {
            categories: Vec::new(),
            last_updated,
        }
    }

    /// Total number of merchants across all categories.
    #[inline]
    #[must_use]
    pub fn merchant_count(&self) -> usize {
        self.categories.iter().map(|category| category.merchants.len()).sum()
    }

    /// Looks up a category by id.
    #[inline]
    #[must_use]
    pub fn category(&self, id: CategoryId) -> Option<&Category> {
        self.categories.iter().find(|category| category.id == id)
    }

    /// Returns `true` when the catalog contains no categories.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}
