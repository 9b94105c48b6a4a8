//! Upstream affiliate networks.

use serde::{Deserialize, Serialize};

/// The affiliate network a merchant or catalog came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Source {
    /// Network publishing an XML program feed.
    Xml,
    /// Network publishing a JSON programs API.
    Json,
}

impl Source {
    /// All sources, in merge priority order.
    pub const ALL: [Self; 2] = [Self::Xml, Self::Json];

    /// Cache key under which this source's catalog is stored.
    #[inline]
    #[must_use]
    pub const fn cache_key(self) -> &'static str {
        match self {
            Self::Xml => "catalog:xml",
            Self::Json => "catalog:json",
        }
    }

    /// Short human-readable label.
    #[inline]
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Xml => "xml",
            Self::Json => "json",
        }
    }
}

impl core::fmt::Display for Source {
    #[inline]
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.label())
    }
}
