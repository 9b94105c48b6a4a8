//! Fetcher for the JSON affiliate network.
//!
//! The programs endpoint has answered with three different top-level
//! shapes over time: a bare array, `{"programs": [...]}` and
//! `{"data": [...]}`. [`ProgramsPayload::classify`] resolves them into a
//! single list of records before any per-record validation runs.

use reqwest::header::ACCEPT;
use secrecy::{ExposeSecret as _, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::{CatalogBuilder, CatalogSource, ParseStats, clean_url};
use crate::error::{AffiliateError, Result};
use crate::fetch::{RetryPolicy, default_http_client, fetch_text, with_retry};
use crate::models::{Catalog, CategoryId, Merchant, MerchantId, Source, category_name_or_fallback};

/// Required approval status.
const APPROVED: &str = "approved";

/// Required activity status, when the record carries one.
const ACTIVE: &str = "active";

/// Top-level response shapes of the programs endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgramsPayload {
    /// The body is the record array itself.
    Bare(Vec<Value>),
    /// Records under a `programs` key.
    Programs(Vec<Value>),
    /// Records under a `data` key.
    Data(Vec<Value>),
}

impl ProgramsPayload {
    /// Determines the shape of a decoded response body.
    ///
    /// # Errors
    ///
    /// Returns [`AffiliateError::MalformedPayload`] if the body is neither
    /// an array nor an object with a `programs` or `data` array.
    #[inline]
    pub fn classify(value: Value) -> Result<Self> {
        match value {
            Value::Array(records) => Ok(Self::Bare(records)),
            Value::Object(mut object) => match (object.remove("programs"), object.remove("data")) {
                (Some(Value::Array(records)), _) => Ok(Self::Programs(records)),
                (_, Some(Value::Array(records))) => Ok(Self::Data(records)),
                _ => Err(AffiliateError::MalformedPayload(
                    "object has no `programs` or `data` array".to_owned(),
                )),
            },
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => Err(
                AffiliateError::MalformedPayload("expected an array or an object".to_owned()),
            ),
        }
    }

    /// Consumes the payload, yielding its records.
    #[inline]
    #[must_use]
    pub fn into_records(self) -> Vec<Value> {
        match self {
            Self::Bare(records) | Self::Programs(records) | Self::Data(records) => records,
        }
    }
}

/// Program id as published: sometimes a number, sometimes a string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawId {
    /// Numeric id.
    Number(serde_json::Number),
    /// Textual id.
    Text(String),
}

impl RawId {
    /// Id as a non-blank string.
    fn into_text(self) -> Option<String> {
        let text = match self {
            Self::Number(number) => number.to_string(),
            Self::Text(text) => text.trim().to_owned(),
        };
        (!text.is_empty()).then_some(text)
    }
}

/// Category as published: a plain name or an object with a `name`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCategory {
    /// Plain name.
    Name(String),
    /// Nested object.
    Object {
        /// Category name.
        name: Option<String>,
    },
}

impl RawCategory {
    /// Category name, if any.
    fn name(&self) -> Option<&str> {
        match *self {
            Self::Name(ref name) => Some(name.as_str()),
            Self::Object { ref name } => name.as_deref(),
        }
    }
}

/// One program record as published.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawProgram {
    /// Program id.
    id: Option<RawId>,
    /// Merchant name.
    name: Option<String>,
    /// Merchant home page.
    url: Option<String>,
    /// Tracking link.
    tracking_url: Option<String>,
    /// Category.
    category: Option<RawCategory>,
    /// Partnership approval status.
    approval_status: Option<String>,
    /// Program activity status.
    status: Option<String>,
}

/// Why a record was not turned into a merchant.
#[derive(Debug)]
enum Rejection {
    /// Not approved or not active.
    Filtered,
    /// A required field is missing or invalid.
    Invalid(&'static str),
}

impl RawProgram {
    /// Validates the record and converts it into a merchant plus its
    /// category name.
    fn into_merchant(self) -> core::result::Result<(String, Merchant), Rejection> {
        let approval = self.approval_status.as_deref().map(str::trim);
        if approval != Some(APPROVED) {
            return Err(Rejection::Filtered);
        }
        if self
            .status
            .as_deref()
            .is_some_and(|status| status.trim() != ACTIVE)
        {
            return Err(Rejection::Filtered);
        }

        let id = self
            .id
            .and_then(RawId::into_text)
            .ok_or(Rejection::Invalid("id"))?;
        let name = self
            .name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or(Rejection::Invalid("name"))?;
        let home = self
            .url
            .as_deref()
            .and_then(clean_url)
            .ok_or(Rejection::Invalid("url"))?;
        let tracking = self
            .tracking_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or(Rejection::Invalid("trackingUrl"))?;
        let category =
            category_name_or_fallback(self.category.as_ref().and_then(RawCategory::name)).to_owned();

        let merchant = Merchant {
            id: MerchantId::new(id),
            display_name: name.to_owned(),
            clean_url: home,
            affiliate_url: tracking.to_owned(),
            category_id: CategoryId::new(0),
            status: APPROVED.to_owned(),
            source: Source::Json,
        };
        Ok((category, merchant))
    }
}

/// Parses a programs response body into a catalog stamped with `now_ms`.
///
/// Records that do not decode, fail validation or are not approved and
/// active are dropped and counted.
///
/// # Errors
///
/// Returns [`AffiliateError::Serialization`] if the body is not JSON and
/// [`AffiliateError::MalformedPayload`] if its top-level shape is unknown.
#[inline]
pub fn parse_json_payload(body: &str, now_ms: i64) -> Result<Catalog> {
    let value: Value = serde_json::from_str(body)?;
    let records = ProgramsPayload::classify(value)?.into_records();

    let mut stats = ParseStats::default();
    let mut builder = CatalogBuilder::new();
    for (index, record) in records.into_iter().enumerate() {
        let raw = match serde_json::from_value::<RawProgram>(record) {
            Ok(raw) => raw,
            Err(err) => {
                stats.invalid += 1;
                warn!(source = %Source::Json, index, error = %err, "skipping undecodable program");
                continue;
            }
        };
        match raw.into_merchant() {
            Ok((category, merchant)) => {
                stats.kept += 1;
                builder.push(&category, merchant);
            }
            Err(Rejection::Filtered) => stats.filtered += 1,
            Err(Rejection::Invalid(field)) => {
                stats.invalid += 1;
                warn!(source = %Source::Json, index, field, "skipping invalid program");
            }
        }
    }
    stats.log(Source::Json);
    Ok(builder.build(now_ms))
}

/// Builder for constructing a [`JsonNetworkSource`].
#[derive(Debug, Default)]
pub struct JsonNetworkSourceBuilder {
    /// Programs endpoint.
    api_url: Option<String>,
    /// Bearer token.
    token: Option<SecretString>,
    /// Retry policy.
    retry: Option<RetryPolicy>,
    /// HTTP client override.
    http: Option<reqwest::Client>,
}

impl JsonNetworkSourceBuilder {
    /// Sets the programs endpoint.
    #[inline]
    #[must_use]
    pub fn api_url<T: Into<String>>(mut self, url: T) -> Self {
        self.api_url = Some(url.into());
        self
    }

    /// Sets the bearer token.
    #[inline]
    #[must_use]
    pub fn token(mut self, token: SecretString) -> Self {
        self.token = Some(token);
        self
    }

    /// Overrides the retry policy.
    #[inline]
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Uses a preconfigured HTTP client.
    #[inline]
    #[must_use]
    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http = Some(client);
        self
    }

    /// Builds the source.
    ///
    /// # Errors
    ///
    /// Returns [`AffiliateError::Config`] if the endpoint or token is
    /// missing or the endpoint does not parse, and
    /// [`AffiliateError::Http`] if the HTTP client fails to build.
    #[inline]
    pub fn build(self) -> Result<JsonNetworkSource> {
        let raw_url = self
            .api_url
            .ok_or_else(|| AffiliateError::Config("JSON API URL is required".to_owned()))?;
        let api_url = url::Url::parse(&raw_url)
            .map_err(|err| AffiliateError::Config(format!("invalid JSON API URL `{raw_url}`: {err}")))?;
        let token = self
            .token
            .ok_or_else(|| AffiliateError::Config("JSON API token is required".to_owned()))?;
        let http = match self.http {
            Some(client) => client,
            None => default_http_client()?,
        };
        Ok(JsonNetworkSource {
            http,
            api_url,
            token,
            retry: self.retry.unwrap_or_default(),
        })
    }
}

/// Source for the JSON affiliate network.
///
/// Use [`JsonNetworkSource::builder()`] to construct an instance.
#[derive(Debug)]
pub struct JsonNetworkSource {
    /// Underlying HTTP client.
    http: reqwest::Client,
    /// Programs endpoint.
    api_url: url::Url,
    /// Bearer token.
    token: SecretString,
    /// Retry policy for every fetch.
    retry: RetryPolicy,
}

impl JsonNetworkSource {
    /// Creates a new builder for configuring the source.
    #[inline]
    #[must_use]
    pub fn builder() -> JsonNetworkSourceBuilder {
        JsonNetworkSourceBuilder::default()
    }

    /// One attempt: GET the programs and parse them.
    async fn fetch_once(&self) -> Result<Catalog> {
        debug!(endpoint = %self.api_url, "requesting JSON programs");
        let request = self
            .http
            .get(self.api_url.clone())
            .bearer_auth(self.token.expose_secret())
            .header(ACCEPT, "application/json");
        let body = fetch_text(request).await?;
        parse_json_payload(&body, chrono::Utc::now().timestamp_millis())
    }
}

impl CatalogSource for JsonNetworkSource {
    #[inline]
    fn kind(&self) -> Source {
        Source::Json
    }

    #[tracing::instrument(skip_all, fields(source = "json"))]
    #[inline]
    async fn fetch(&self) -> Result<Catalog> {
        with_retry(self.retry, Source::Json.label(), || self.fetch_once()).await
    }
}
