//! Error types for the affiliate catalog library.

use std::sync::Arc;
use std::time::Duration;

/// All errors that can occur while fetching, caching or merging catalogs.
#[derive(Debug, thiserror::Error)]
pub enum AffiliateError {
    /// HTTP transport failed (connect, TLS, body read).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Upstream returned a non-success status code.
    #[error("API error (HTTP {status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body or a placeholder when it could not be read.
        message: String,
    },

    /// Upstream returned an empty body.
    #[error("upstream returned an empty response body")]
    EmptyResponse,

    /// Upstream body parsed but its top-level structure is not the
    /// expected one.
    #[error("malformed upstream payload: {0}")]
    MalformedPayload(String),

    /// A single upstream attempt did not finish in time.
    #[error("upstream request timed out after {0:?}")]
    Timeout(Duration),

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// XML deserialization failed.
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::DeError),

    /// Cache storage backend failed.
    #[error("cache storage error: {0}")]
    Storage(Box<dyn core::error::Error + Send + Sync>),

    /// Configuration is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Error produced by a fetch shared between several callers.
    #[error(transparent)]
    Shared(Arc<AffiliateError>),

    /// A background fetch task was aborted or panicked.
    #[error("fetch task failed: {0}")]
    Task(String),

    /// Nothing is cached for the key after waiting on a concurrent refresh.
    #[error("no cached value for key `{key}`")]
    NotCached {
        /// Cache key.
        key: String,
    },

    /// Gave up waiting for another refresh of the same key.
    #[error("timed out waiting for refresh lock on key `{key}`")]
    RefreshLockTimeout {
        /// Cache key.
        key: String,
    },

    /// No source produced data and nothing is cached for any of them.
    #[error("no catalog data available from any source")]
    NoDataAvailable,
}

impl AffiliateError {
    /// Returns `true` for failures worth retrying: transport errors,
    /// non-success statuses, empty or malformed payloads and timeouts.
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match *self {
            Self::Http(_)
            | Self::Api { .. }
            | Self::EmptyResponse
            | Self::MalformedPayload(_)
            | Self::Timeout(_)
            | Self::Serialization(_)
            | Self::Xml(_) => true,
            Self::Shared(ref inner) => inner.is_transient(),
            Self::Storage(_)
            | Self::Config(_)
            | Self::Task(_)
            | Self::NotCached { .. }
            | Self::RefreshLockTimeout { .. }
            | Self::NoDataAvailable => false,
        }
    }
}

/// Convenience alias for results in this crate.
pub type Result<T> = core::result::Result<T, AffiliateError>;
