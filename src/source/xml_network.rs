//! Fetcher for the XML affiliate network.
//!
//! The network publishes its program list as an XML feed:
//!
//! ```xml
//! <feed>
//!   <programs>
//!     <program>
//!       <id>1042</id>
//!       <name>Zalando</name>
//!       <url>https://www.zalando.dk</url>
//!       <affiliate_url>https://track.example/c?id=1042</affiliate_url>
//!       <category>Mode</category>
//!       <status>approved</status>
//!     </program>
//!   </programs>
//! </feed>
//! ```

use quick_xml::Reader;
use quick_xml::events::Event;
use secrecy::{ExposeSecret as _, SecretString};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{CatalogBuilder, CatalogSource, ParseStats, clean_url};
use crate::error::{AffiliateError, Result};
use crate::fetch::{RetryPolicy, default_http_client, fetch_text, with_retry};
use crate::models::{Catalog, CategoryId, Merchant, MerchantId, Source, category_name_or_fallback};

/// Query parameter carrying the partner id.
const PARTNER_ID_PARAM: &str = "partnerid";

/// Status value of programs the partner may promote.
const APPROVED: &str = "approved";

/// Element wrapping the program list, a direct child of the root.
const PROGRAMS_TAG: &[u8] = b"programs";

/// Element of a single program.
const PROGRAM_TAG: &[u8] = b"program";

/// One `<program>` element as published. Every field is optional here;
/// validation happens per record.
#[derive(Debug, Default, Deserialize)]
struct RawXmlProgram {
    /// Program id.
    id: Option<String>,
    /// Merchant name.
    name: Option<String>,
    /// Merchant home page.
    url: Option<String>,
    /// Tracking link.
    affiliate_url: Option<String>,
    /// Category name.
    category: Option<String>,
    /// Approval status.
    status: Option<String>,
}

/// Why a record was not turned into a merchant.
#[derive(Debug)]
enum Rejection {
    /// Status is not `approved`.
    Filtered,
    /// A required field is missing or invalid.
    Invalid(&'static str),
}

/// Returns the trimmed value when present and non-blank.
fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|text| !text.is_empty())
}

impl RawXmlProgram {
    /// Validates the record and converts it into a merchant plus its
    /// category name.
    fn into_merchant(self) -> core::result::Result<(String, Merchant), Rejection> {
        let status = non_blank(self.status.as_deref()).unwrap_or_default();
        if status != APPROVED {
            return Err(Rejection::Filtered);
        }
        let id = non_blank(self.id.as_deref()).ok_or(Rejection::Invalid("id"))?;
        let name = non_blank(self.name.as_deref()).ok_or(Rejection::Invalid("name"))?;
        let home = self
            .url
            .as_deref()
            .and_then(clean_url)
            .ok_or(Rejection::Invalid("url"))?;
        let affiliate_url =
            non_blank(self.affiliate_url.as_deref()).ok_or(Rejection::Invalid("affiliate_url"))?;
        let category = category_name_or_fallback(self.category.as_deref()).to_owned();

        let merchant = Merchant {
            id: MerchantId::new(id.to_owned()),
            display_name: name.to_owned(),
            clean_url: home,
            affiliate_url: affiliate_url.to_owned(),
            category_id: CategoryId::new(0),
            status: status.to_owned(),
            source: Source::Xml,
        };
        Ok((category, merchant))
    }
}

/// Parses an XML feed body into a catalog stamped with `now_ms`.
///
/// Every `<program>` is decoded on its own, so a structurally broken
/// record is dropped and counted like any other invalid one. Invalid and
/// unapproved programs are dropped and counted.
///
/// # Errors
///
/// Returns [`AffiliateError::Xml`] if the body is not well-formed XML and
/// [`AffiliateError::MalformedPayload`] if it has no `<programs>` element.
#[inline]
pub fn parse_xml_feed(body: &str, now_ms: i64) -> Result<Catalog> {
    let records = program_records(body)?
        .ok_or_else(|| AffiliateError::MalformedPayload("feed has no <programs> element".to_owned()))?;

    let mut stats = ParseStats::default();
    let mut builder = CatalogBuilder::new();
    for (index, record) in records.into_iter().enumerate() {
        let raw = match quick_xml::de::from_str::<RawXmlProgram>(record) {
            Ok(raw) => raw,
            Err(err) => {
                stats.invalid += 1;
                warn!(source = %Source::Xml, index, error = %err, "skipping undecodable program");
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
                warn!(source = %Source::Xml, index, field, "skipping invalid program");
            }
        }
    }
    stats.log(Source::Xml);
    Ok(builder.build(now_ms))
}

/// Splits the feed into the raw text of each `<program>` element found
/// under `<programs>`. Returns `None` when the root has no `<programs>`
/// child.
fn program_records(body: &str) -> Result<Option<Vec<&str>>> {
    let mut reader = Reader::from_str(body);
    let mut records = Vec::new();
    let mut depth = 0_usize;
    let mut found = false;
    let mut in_programs = false;

    loop {
        let start = byte_offset(reader.buffer_position());
        match reader.read_event().map_err(xml_error)? {
            Event::Start(element) => {
                depth += 1;
                let name = element.name();
                if in_programs && depth == 3 && name.as_ref() == PROGRAM_TAG {
                    let _inner = reader.read_to_end(name).map_err(xml_error)?;
                    depth -= 1;
                    let end = byte_offset(reader.buffer_position());
                    records.push(body.get(start..end).unwrap_or_default());
                } else if depth == 2 && name.as_ref() == PROGRAMS_TAG {
                    found = true;
                    in_programs = true;
                }
            }
            Event::Empty(element) => {
                let name = element.name();
                if in_programs && depth == 2 && name.as_ref() == PROGRAM_TAG {
                    let end = byte_offset(reader.buffer_position());
                    records.push(body.get(start..end).unwrap_or_default());
                } else if depth == 1 && name.as_ref() == PROGRAMS_TAG {
                    found = true;
                }
            }
            Event::End(_) => {
                if depth == 2 {
                    in_programs = false;
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            Event::Text(_)
            | Event::CData(_)
            | Event::Comment(_)
            | Event::Decl(_)
            | Event::PI(_)
            | Event::DocType(_) => {}
        }
    }
    Ok(found.then_some(records))
}

/// Converts a reader position into a string index.
fn byte_offset<P: TryInto<usize>>(position: P) -> usize {
    position.try_into().unwrap_or(usize::MAX)
}

/// Wraps a reader error as a deserialization error.
fn xml_error(err: quick_xml::Error) -> AffiliateError {
    AffiliateError::Xml(quick_xml::DeError::from(err))
}

/// Builder for constructing an [`XmlNetworkSource`].
#[derive(Debug, Default)]
pub struct XmlNetworkSourceBuilder {
    /// Feed endpoint.
    feed_url: Option<String>,
    /// Partner id sent with every request.
    partner_id: Option<SecretString>,
    /// Retry policy.
    retry: Option<RetryPolicy>,
    /// HTTP client override.
    http: Option<reqwest::Client>,
}

impl XmlNetworkSourceBuilder {
    /// Sets the feed endpoint.
    #[inline]
    #[must_use]
    pub fn feed_url<T: Into<String>>(mut self, url: T) -> Self {
        self.feed_url = Some(url.into());
        self
    }

    /// Sets the partner id.
    #[inline]
    #[must_use]
    pub fn partner_id(mut self, partner_id: SecretString) -> Self {
        self.partner_id = Some(partner_id);
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
    /// Returns [`AffiliateError::Config`] if the feed URL or partner id is
    /// missing or the URL does not parse, and [`AffiliateError::Http`] if
    /// the HTTP client fails to build.
    #[inline]
    pub fn build(self) -> Result<XmlNetworkSource> {
        let raw_url = self
            .feed_url
            .ok_or_else(|| AffiliateError::Config("XML feed URL is required".to_owned()))?;
        let feed_url = url::Url::parse(&raw_url)
            .map_err(|err| AffiliateError::Config(format!("invalid XML feed URL `{raw_url}`: {err}")))?;
        let partner_id = self
            .partner_id
            .ok_or_else(|| AffiliateError::Config("XML partner id is required".to_owned()))?;
        let http = match self.http {
            Some(client) => client,
            None => default_http_client()?,
        };
        Ok(XmlNetworkSource {
            http,
            feed_url,
            partner_id,
            retry: self.retry.unwrap_or_default(),
        })
    }
}

/// Source for the XML affiliate network.
///
/// Use [`XmlNetworkSource::builder()`] to construct an instance.
#[derive(Debug)]
pub struct XmlNetworkSource {
    /// Underlying HTTP client.
    http: reqwest::Client,
    /// Feed endpoint without the partner id.
    feed_url: url::Url,
    /// Partner id.
    partner_id: SecretString,
    /// Retry policy for every fetch.
    retry: RetryPolicy,
}

impl XmlNetworkSource {
    /// Creates a new builder for configuring the source.
    #[inline]
    #[must_use]
    pub fn builder() -> XmlNetworkSourceBuilder {
        XmlNetworkSourceBuilder::default()
    }

    /// Request URL including the partner id.
    fn request_url(&self) -> Result<url::Url> {
        url::Url::parse_with_params(
            self.feed_url.as_str(),
            &[(PARTNER_ID_PARAM, self.partner_id.expose_secret())],
        )
        .map_err(|err| AffiliateError::Config(format!("invalid XML feed URL: {err}")))
    }

    /// One attempt: GET the feed and parse it.
    async fn fetch_once(&self) -> Result<Catalog> {
        let url = self.request_url()?;
        debug!(endpoint = %self.feed_url, "requesting XML feed");
        let body = fetch_text(self.http.get(url)).await?;
        parse_xml_feed(&body, chrono::Utc::now().timestamp_millis())
    }
}

impl CatalogSource for XmlNetworkSource {
    #[inline]
    fn kind(&self) -> Source {
        Source::Xml
    }

    #[tracing::instrument(skip_all, fields(source = "xml"))]
    #[inline]
    async fn fetch(&self) -> Result<Catalog> {
        with_retry(self.retry, Source::Xml.label(), || self.fetch_once()).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::models::generate_category_id;

    const FEED: &str = r"<?xml version='1.0' encoding='UTF-8'?>
<feed>
  <programs>
    <program>
      <id>1</id>
      <name>Zalando</name>
      <url>www.zalando.dk</url>
      <affiliate_url>https://track.example/c?id=1</affiliate_url>
      <category>Mode</category>
      <status>approved</status>
    </program>
    <program>
      <id>2</id>
      <name>Pending Shop</name>
      <url>https://pending.dk</url>
      <affiliate_url>https://track.example/c?id=2</affiliate_url>
      <category>Mode</category>
      <status>pending</status>
    </program>
    <program>
      <id>3</id>
      <name>No Url</name>
      <affiliate_url>https://track.example/c?id=3</affiliate_url>
      <status>approved</status>
    </program>
    <program>
      <id>4</id>
      <name>Misc Shop</name>
      <url>https://misc.dk</url>
      <affiliate_url>https://track.example/c?id=4</affiliate_url>
      <status>approved</status>
    </program>
  </programs>
</feed>";

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            timeout: Duration::from_secs(5),
        }
    }

    fn source_for(server: &MockServer) -> XmlNetworkSource {
        XmlNetworkSource::builder()
            .feed_url(format!("{}/feed", server.uri()))
            .partner_id(SecretString::from("partner-7"))
            .retry_policy(quick_policy())
            .build()
            .unwrap()
    }

    #[test]
    fn parse_keeps_approved_valid_programs() {
        let catalog = parse_xml_feed(FEED, 99).unwrap();
        assert_eq!(catalog.last_updated, 99);
        assert_eq!(catalog.merchant_count(), 2);

        let mode = catalog.category(generate_category_id("Mode")).unwrap();
        assert_eq!(mode.merchants.len(), 1);
        assert_eq!(mode.merchants[0].display_name, "Zalando");
        assert_eq!(mode.merchants[0].clean_url, "https://www.zalando.dk");
        assert_eq!(mode.merchants[0].source, Source::Xml);

        let fallback = catalog.category(generate_category_id("Diverse")).unwrap();
        assert_eq!(fallback.name, "Diverse");
        assert_eq!(fallback.merchants[0].id, MerchantId::new("4".to_owned()));
    }

    #[test]
    fn parse_sorts_categories_by_id() {
        let catalog = parse_xml_feed(FEED, 0).unwrap();
        let ids: Vec<CategoryId> = catalog.categories.iter().map(|c| c.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn parse_without_programs_is_malformed() {
        let result = parse_xml_feed("<feed><meta>x</meta></feed>", 0);
        assert!(matches!(result, Err(AffiliateError::MalformedPayload(_))));
    }

    #[test]
    fn parse_empty_programs_gives_empty_catalog() {
        let catalog = parse_xml_feed("<feed><programs></programs></feed>", 3).unwrap();
        assert!(catalog.is_empty());
        assert_eq!(catalog.last_updated, 3);
    }

    #[test]
    fn broken_program_is_skipped_and_rest_kept() {
        let feed = r"<feed>
  <programs>
    <program>
      <id>1</id>
      <name>Zalando</name>
      <url>https://zalando.dk</url>
      <affiliate_url>https://track.example/c?id=1&amp;src=x</affiliate_url>
      <category>Mode</category>
      <status>approved</status>
    </program>
    <program>
      <id>2</id>
      <id>3</id>
      <name>Twice</name>
      <url>https://twice.dk</url>
      <affiliate_url>https://track.example/c?id=2</affiliate_url>
      <status>approved</status>
    </program>
    <program>
      <id>4</id>
      <name><b>Bold</b></name>
      <url>https://bold.dk</url>
      <affiliate_url>https://track.example/c?id=4</affiliate_url>
      <status>approved</status>
    </program>
    <program/>
  </programs>
</feed>";
        let catalog = parse_xml_feed(feed, 0).unwrap();
        assert_eq!(catalog.merchant_count(), 1);
        let merchant = &catalog.categories[0].merchants[0];
        assert_eq!(merchant.display_name, "Zalando");
        assert_eq!(merchant.affiliate_url, "https://track.example/c?id=1&src=x");
    }

    #[test]
    fn programs_outside_the_list_are_ignored() {
        let feed = "<feed><program><id>9</id></program><programs/></feed>";
        let catalog = parse_xml_feed(feed, 0).unwrap();
        assert!(catalog.is_empty());
    }

    #[test]
    fn mismatched_tags_fail_the_feed() {
        let result = parse_xml_feed("<feed><programs><program></programs></feed>", 0);
        assert!(matches!(result, Err(AffiliateError::Xml(_))));
    }

    #[test]
    fn builder_requires_url_and_partner() {
        assert!(matches!(
            XmlNetworkSource::builder().build(),
            Err(AffiliateError::Config(_))
        ));
        assert!(matches!(
            XmlNetworkSource::builder().feed_url("https://feed.example/x").build(),
            Err(AffiliateError::Config(_))
        ));
        assert!(matches!(
            XmlNetworkSource::builder()
                .feed_url("not a url")
                .partner_id(SecretString::from("p"))
                .build(),
            Err(AffiliateError::Config(_))
        ));
    }

    #[test]
    fn debug_does_not_leak_partner_id() {
        let source = XmlNetworkSource::builder()
            .feed_url("https://feed.example/x")
            .partner_id(SecretString::from("very-secret"))
            .build()
            .unwrap();
        assert!(!format!("{source:?}").contains("very-secret"));
    }

    #[tokio::test]
    async fn fetch_sends_partner_id_and_parses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .and(query_param("partnerid", "partner-7"))
            .respond_with(ResponseTemplate::new(200).set_body_string(FEED))
            .expect(1)
            .mount(&server)
            .await;

        let catalog = source_for(&server).fetch().await.unwrap();
        assert_eq!(catalog.merchant_count(), 2);
    }

    #[tokio::test]
    async fn fetch_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(ResponseTemplate::new(200).set_body_string(FEED))
            .mount(&server)
            .await;

        let catalog = source_for(&server).fetch().await.unwrap();
        assert_eq!(catalog.merchant_count(), 2);
    }

    #[tokio::test]
    async fn fetch_fails_after_repeated_empty_bodies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("   "))
            .expect(3)
            .mount(&server)
            .await;

        let result = source_for(&server).fetch().await;
        assert!(matches!(result, Err(AffiliateError::EmptyResponse)));
    }
}
