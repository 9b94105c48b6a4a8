//! Data models for affiliate catalogs.
//!
//! This module contains the normalized schema shared by every source
//! fetcher, the merger and the cache: merchants, categories, catalogs,
//! newtype ids and the name-derived category identity.

mod catalog;
mod category;
mod ids;
mod merchant;
mod source;

pub use catalog::Catalog;
pub use category::{
    Category, FALLBACK_CATEGORY, category_name_or_fallback, generate_category_id,
    normalize_category_name,
};
pub use ids::{CategoryId, MerchantId};
pub use merchant::Merchant;
pub use source::Source;
