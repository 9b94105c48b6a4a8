//! Environment-driven configuration.
//!
//! Endpoints and credentials are required; cache, fetch and scheduler
//! tuning fall back to defaults. Every variable is prefixed with
//! `AFFILIATE_`.

use std::time::Duration;

use chrono::NaiveTime;
use secrecy::SecretString;

use crate::cache::CacheConfig;
use crate::error::{AffiliateError, Result};
use crate::fetch::RetryPolicy;
use crate::scheduler::SchedulerConfig;
use crate::source::{JsonNetworkSource, SourceRegistration, XmlNetworkSource};

/// XML feed endpoint.
pub const XML_FEED_URL: &str = "AFFILIATE_XML_FEED_URL";
/// XML network partner id.
pub const XML_PARTNER_ID: &str = "AFFILIATE_XML_PARTNER_ID";
/// JSON programs API endpoint.
pub const JSON_API_URL: &str = "AFFILIATE_JSON_API_URL";
/// JSON API bearer token.
pub const JSON_API_TOKEN: &str = "AFFILIATE_JSON_API_TOKEN";
/// Entry time-to-live in hours.
pub const CACHE_TTL_HOURS: &str = "AFFILIATE_CACHE_TTL_HOURS";
/// Staleness threshold in hours.
pub const CACHE_STALE_HOURS: &str = "AFFILIATE_CACHE_STALE_HOURS";
/// Attempts per upstream fetch.
pub const FETCH_ATTEMPTS: &str = "AFFILIATE_FETCH_ATTEMPTS";
/// Base retry backoff in milliseconds.
pub const FETCH_BACKOFF_MS: &str = "AFFILIATE_FETCH_BACKOFF_MS";
/// Per-attempt timeout in seconds.
pub const FETCH_TIMEOUT_SECS: &str = "AFFILIATE_FETCH_TIMEOUT_SECS";
/// Daily refresh time, `HH:MM` UTC.
pub const REFRESH_AT: &str = "AFFILIATE_REFRESH_AT";
/// Delay before retrying a failed refresh run, in hours.
pub const RETRY_DELAY_HOURS: &str = "AFFILIATE_RETRY_DELAY_HOURS";

/// Seconds per hour.
const HOUR_SECS: u64 = 60 * 60;

/// Accepted format of [`REFRESH_AT`].
const REFRESH_AT_FORMAT: &str = "%H:%M";

/// Full runtime configuration.
#[derive(Debug)]
pub struct Config {
    /// XML feed endpoint.
    pub xml_feed_url: String,
    /// XML network partner id.
    pub xml_partner_id: SecretString,
    /// JSON programs API endpoint.
    pub json_api_url: String,
    /// JSON API bearer token.
    pub json_api_token: SecretString,
    /// Cache tuning.
    pub cache: CacheConfig,
    /// Upstream retry policy, shared by both sources.
    pub retry: RetryPolicy,
    /// Refresh scheduling.
    pub scheduler: SchedulerConfig,
}

impl Config {
    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`AffiliateError::Config`] if a required variable is
    /// missing or any variable fails to parse.
    #[inline]
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable
    /// name to its value.
    ///
    /// # Errors
    ///
    /// Returns [`AffiliateError::Config`] if a required variable is
    /// missing or any variable fails to parse.
    #[inline]
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Lookup(lookup);
        let defaults = CacheConfig::default();
        let cache = CacheConfig {
            ttl: vars.hours(CACHE_TTL_HOURS, defaults.ttl)?,
            stale_after: vars.hours(CACHE_STALE_HOURS, defaults.stale_after)?,
            ..defaults
        };
        if cache.stale_after > cache.ttl {
            return Err(AffiliateError::Config(format!(
                "{CACHE_STALE_HOURS} must not exceed {CACHE_TTL_HOURS}"
            )));
        }

        let default_retry = RetryPolicy::default();
        let retry = RetryPolicy {
            attempts: vars.parsed(FETCH_ATTEMPTS)?.unwrap_or(default_retry.attempts),
            base_delay: vars
                .parsed(FETCH_BACKOFF_MS)?
                .map_or(default_retry.base_delay, Duration::from_millis),
            timeout: vars
                .parsed(FETCH_TIMEOUT_SECS)?
                .map_or(default_retry.timeout, Duration::from_secs),
            ..default_retry
        };

        let default_scheduler = SchedulerConfig::default();
        let daily_at = match vars.get(REFRESH_AT) {
            Some(raw) => NaiveTime::parse_from_str(raw.trim(), REFRESH_AT_FORMAT).map_err(|err| {
                AffiliateError::Config(format!("{REFRESH_AT} must be HH:MM, got `{raw}`: {err}"))
            })?,
            None => default_scheduler.daily_at,
        };
        let scheduler = SchedulerConfig {
            daily_at,
            retry_delay: vars.hours(RETRY_DELAY_HOURS, default_scheduler.retry_delay)?,
            ..default_scheduler
        };

        Ok(Self {
            xml_feed_url: vars.required(XML_FEED_URL)?,
            xml_partner_id: SecretString::from(vars.required(XML_PARTNER_ID)?),
            json_api_url: vars.required(JSON_API_URL)?,
            json_api_token: SecretString::from(vars.required(JSON_API_TOKEN)?),
            cache,
            retry,
            scheduler,
        })
    }

    /// Builds the XML network source.
    ///
    /// # Errors
    ///
    /// Returns an error if the feed URL is invalid or the HTTP client
    /// fails to build.
    #[inline]
    pub fn xml_source(&self) -> Result<XmlNetworkSource> {
        XmlNetworkSource::builder()
            .feed_url(self.xml_feed_url.as_str())
            .partner_id(self.xml_partner_id.clone())
            .retry_policy(self.retry)
            .build()
    }

    /// Builds the JSON network source.
    ///
    /// # Errors
    ///
    /// Returns an error if the API URL is invalid or the HTTP client
    /// fails to build.
    #[inline]
    pub fn json_source(&self) -> Result<JsonNetworkSource> {
        JsonNetworkSource::builder()
            .api_url(self.json_api_url.as_str())
            .token(self.json_api_token.clone())
            .retry_policy(self.retry)
            .build()
    }

    /// Both sources registered in merge priority order, XML first.
    ///
    /// # Errors
    ///
    /// Returns an error if either source fails to build.
    #[inline]
    pub fn registrations(&self) -> Result<Vec<SourceRegistration>> {
        Ok(vec![
            SourceRegistration::new(self.xml_source()?),
            SourceRegistration::new(self.json_source()?),
        ])
    }
}

/// Variable lookup with parse helpers.
struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Value of `name`, treating blank values as unset.
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|value| !value.trim().is_empty())
    }

    /// Value of a variable that must be set.
    fn required(&self, name: &str) -> Result<String> {
        self.get(name)
            .ok_or_else(|| AffiliateError::Config(format!("{name} is not set")))
    }

    /// Parsed value of an optional variable.
    fn parsed<V>(&self, name: &str) -> Result<Option<V>>
    where
        V: core::str::FromStr,
        V::Err: core::fmt::Display,
    {
        self.get(name)
            .map(|raw| {
                raw.trim().parse().map_err(|err| {
                    AffiliateError::Config(format!("{name} has invalid value `{raw}`: {err}"))
                })
            })
            .transpose()
    }

    /// Optional whole-hour duration.
    fn hours(&self, name: &str, default: Duration) -> Result<Duration> {
        Ok(self
            .parsed::<u64>(name)?
            .map_or(default, |hours| Duration::from_secs(hours.saturating_mul(HOUR_SECS))))
    }
}
