//! eCFR API client.
//!
//! Wraps the four endpoints the pipeline consumes:
//!
//! | Operation | Endpoint |
//! |-----------|----------|
//! | [`CorpusSource::get_count`] | `GET /search/v1/count` |
//! | [`CorpusSource::search_documents`] | `GET /search/v1/results` |
//! | [`CorpusSource::get_content`] | `GET /versioner/v1/full/<date>/title-<N>.xml` |
//! | [`CorpusClient::get_agencies`] | `GET /admin/v1/agencies.json` |
//!
//! # Retry Strategy
//!
//! Every request shares one retry budget (`max_retries`, default 3):
//! - HTTP 429 → wait `base × (1 + jitter)`
//! - any other HTTP or transport error → wait `base × attempt × (1 + jitter)`
//! - jitter is uniform in `[0, 1)`, `base` defaults to 10s
//!
//! Once the budget is spent the search, count and content operations
//! soft-fail (empty page, zero, [`ContentFetch::NotFound`]). Callers treat
//! that as "try again later", never as fatal.
//!
//! # Date Recovery
//!
//! The versioner rejects dates past a title's most recent issue with HTTP 400
//! and names the last valid date in the message. [`classify_content_error`]
//! turns that message into a date and `get_content` retries exactly once
//! with it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::CorpusConfig;
use crate::models::{AgencyRecord, DateRange, Hierarchy, SearchResult};

/// Failure of a single corpus request, after classification.
#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("rate limited by the corpus API")]
    RateLimited,

    #[error("corpus API returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("requested date is past the most recent issue date {0}")]
    DateRangeRecoverable(NaiveDate),

    #[error("unexpected response body: {0}")]
    Decode(String),
}

/// Backoff parameters shared by every request.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Wait after an HTTP 429.
    pub fn rate_limit_delay(&self, jitter: f64) -> Duration {
        self.base.mul_f64(1.0 + jitter.clamp(0.0, 1.0))
    }

    /// Wait after any other failure. `attempt` is 1-based.
    pub fn error_delay(&self, attempt: u32, jitter: f64) -> Duration {
        self.base
            .mul_f64(f64::from(attempt.max(1)) * (1.0 + jitter.clamp(0.0, 1.0)))
    }

    fn delay_for(&self, err: &CorpusError, attempt: u32) -> Duration {
        let jitter: f64 = rand::random();
        match err {
            CorpusError::RateLimited => self.rate_limit_delay(jitter),
            _ => self.error_delay(attempt, jitter),
        }
    }
}

/// One page of search results.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultPage {
    #[serde(default)]
    pub results: Vec<SearchResult>,
}

/// Query parameters locating a document inside a title.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentLocator {
    pub chapter: Option<String>,
    pub part: Option<String>,
    pub section: Option<String>,
    pub appendix: Option<String>,
}

impl From<&Hierarchy> for ContentLocator {
    fn from(h: &Hierarchy) -> Self {
        Self {
            chapter: h.chapter.clone(),
            part: h.part.clone(),
            section: h.section.clone(),
            appendix: h.appendix.clone(),
        }
    }
}

impl ContentLocator {
    fn query_pairs(&self) -> Vec<(&'static str, &str)> {
        [
            ("chapter", &self.chapter),
            ("part", &self.part),
            ("section", &self.section),
            ("appendix", &self.appendix),
        ]
        .into_iter()
        .filter_map(|(k, v)| v.as_deref().map(|v| (k, v)))
        .collect()
    }
}

/// Outcome of a content request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentFetch {
    /// Markup served for `version_date`, which differs from the requested
    /// date when the date-recovery path was taken.
    Found {
        text: String,
        version_date: NaiveDate,
    },
    NotFound,
}

/// The operations the ingestion pipeline needs from the corpus.
///
/// [`CorpusClient`] is the production implementation; tests substitute
/// scripted sources.
#[async_trait]
pub trait CorpusSource: Send + Sync {
    /// Fetch one page (0-based) of search results. Soft-fails to an empty page.
    async fn search_documents(
        &self,
        agency_slug: &str,
        page: u32,
        page_size: u32,
        range: &DateRange,
    ) -> ResultPage;

    /// Fetch raw markup. Soft-fails to [`ContentFetch::NotFound`].
    async fn get_content(
        &self,
        date: NaiveDate,
        title: &str,
        locator: &ContentLocator,
    ) -> ContentFetch;

    /// Total number of search results. Soft-fails to `0`.
    async fn get_count(&self, agency_slug: &str, range: &DateRange) -> u64;
}

/// HTTP client for the eCFR API.
///
/// Cheap to clone; clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct CorpusClient {
    http: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

#[derive(Deserialize)]
struct CountResponse {
    #[serde(default)]
    meta: CountMeta,
}

#[derive(Deserialize, Default)]
struct CountMeta {
    #[serde(default)]
    total_count: u64,
}

impl CorpusClient {
    pub fn new(config: &CorpusConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            retry: RetryPolicy {
                max_retries: config.max_retries,
                base: Duration::from_millis(config.backoff_base_ms),
            },
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// List every agency known to the corpus.
    ///
    /// Unlike the pipeline operations this one propagates failure: it backs
    /// a configuration step, not a crawl.
    pub async fn get_agencies(&self) -> anyhow::Result<Vec<AgencyRecord>> {
        let url = format!("{}/admin/v1/agencies.json", self.base_url);
        let body = self
            .send_with_retry("agencies", || {
                self.http.get(&url).header("accept", "application/json")
            })
            .await?;
        parse_agencies(&body)
    }

    fn range_params(range: &DateRange) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(since) = range.since {
            params.push(("last_modified_on_or_after", since.to_string()));
        }
        if let Some(until) = range.until {
            params.push(("last_modified_before", until.to_string()));
        }
        params
    }

    async fn try_search(
        &self,
        agency_slug: &str,
        page: u32,
        page_size: u32,
        range: &DateRange,
    ) -> Result<ResultPage, CorpusError> {
        let url = format!("{}/search/v1/results", self.base_url);
        // The API numbers pages from 1.
        let api_page = (page + 1).to_string();
        let per_page = page_size.to_string();
        let body = self
            .send_with_retry("search", || {
                self.http
                    .get(&url)
                    .query(&[("agency_slugs[]", agency_slug)])
                    .query(&[
                        ("per_page", per_page.as_str()),
                        ("page", api_page.as_str()),
                        ("order", "relevance"),
                        ("paginate_by", "results"),
                    ])
                    .query(&Self::range_params(range))
            })
            .await?;
        serde_json::from_str(&body).map_err(|e| CorpusError::Decode(e.to_string()))
    }

    async fn try_count(&self, agency_slug: &str, range: &DateRange) -> Result<u64, CorpusError> {
        let url = format!("{}/search/v1/count", self.base_url);
        let body = self
            .send_with_retry("count", || {
                self.http
                    .get(&url)
                    .query(&[("agency_slugs[]", agency_slug)])
                    .query(&Self::range_params(range))
            })
            .await?;
        let parsed: CountResponse =
            serde_json::from_str(&body).map_err(|e| CorpusError::Decode(e.to_string()))?;
        Ok(parsed.meta.total_count)
    }

    async fn try_content(
        &self,
        date: NaiveDate,
        title: &str,
        locator: &ContentLocator,
    ) -> Result<String, CorpusError> {
        let url = format!(
            "{}/versioner/v1/full/{}/title-{}.xml",
            self.base_url,
            date.format("%Y-%m-%d"),
            title
        );
        let pairs = locator.query_pairs();
        self.send_with_retry("content", || self.http.get(&url).query(&pairs))
            .await
    }

    /// Run a request under the retry policy.
    ///
    /// `build` is called once per attempt since a `RequestBuilder` is
    /// consumed by `send`. A recoverable date error is returned at once;
    /// resending the same date cannot succeed.
    async fn send_with_retry<F>(&self, label: &str, build: F) -> Result<String, CorpusError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0u32;
        loop {
            let err = match send_once(build()).await {
                Ok(body) => return Ok(body),
                Err(err @ CorpusError::DateRangeRecoverable(_)) => return Err(err),
                Err(err) => err,
            };
            attempt += 1;
            if attempt > self.retry.max_retries {
                warn!(request = label, attempts = attempt, error = %err, "retries exhausted");
                return Err(err);
            }
            let delay = self.retry.delay_for(&err, attempt);
            debug!(
                request = label,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying corpus request"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

async fn send_once(request: reqwest::RequestBuilder) -> Result<String, CorpusError> {
    let response = request.send().await?;
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(CorpusError::RateLimited);
    }
    let body = response.text().await?;
    if status.is_success() {
        return Ok(body);
    }
    if status == StatusCode::BAD_REQUEST {
        if let Some(date) = classify_content_error(&body) {
            return Err(CorpusError::DateRangeRecoverable(date));
        }
    }
    Err(CorpusError::Http {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl CorpusSource for CorpusClient {
    async fn search_documents(
        &self,
        agency_slug: &str,
        page: u32,
        page_size: u32,
        range: &DateRange,
    ) -> ResultPage {
        match self.try_search(agency_slug, page, page_size, range).await {
            Ok(page) => page,
            Err(e) => {
                warn!(agency = agency_slug, page, error = %e, "search failed, returning empty page");
                ResultPage::default()
            }
        }
    }

    async fn get_content(
        &self,
        date: NaiveDate,
        title: &str,
        locator: &ContentLocator,
    ) -> ContentFetch {
        let corrected = match self.try_content(date, title, locator).await {
            Ok(text) => {
                return ContentFetch::Found {
                    text,
                    version_date: date,
                }
            }
            Err(CorpusError::DateRangeRecoverable(corrected)) => corrected,
            Err(e) => {
                warn!(title, %date, error = %e, "content fetch failed");
                return ContentFetch::NotFound;
            }
        };

        debug!(title, requested = %date, %corrected, "retrying content with last issue date");
        match self.try_content(corrected, title, locator).await {
            Ok(text) => ContentFetch::Found {
                text,
                version_date: corrected,
            },
            Err(e) => {
                warn!(title, date = %corrected, error = %e, "content fetch failed after date recovery");
                ContentFetch::NotFound
            }
        }
    }

    async fn get_count(&self, agency_slug: &str, range: &DateRange) -> u64 {
        match self.try_count(agency_slug, range).await {
            Ok(count) => count,
            Err(e) => {
                warn!(agency = agency_slug, error = %e, "count failed, returning 0");
                0
            }
        }
    }
}

const ISSUE_DATE_PHRASE: &str = "most recent issue date";

static ISO_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{4}-\d{2}-\d{2})").expect("ISO date pattern"));

/// Extract the corrected date from a versioner HTTP 400 body.
///
/// Contract: returns `Some(date)` only when the body mentions the title's
/// "most recent issue date" (case-insensitive) and an ISO `YYYY-MM-DD` date
/// follows that phrase; the first such date wins. Any other body, including
/// one with dates but without the phrase, yields `None`.
pub fn classify_content_error(body: &str) -> Option<NaiveDate> {
    let lower = body.to_ascii_lowercase();
    let at = lower.find(ISSUE_DATE_PHRASE)?;
    let tail = &body[at + ISSUE_DATE_PHRASE.len()..];
    let found = ISO_DATE
        .captures_iter(tail)
        .filter_map(|c| c.get(1))
        .find_map(|m| NaiveDate::parse_from_str(m.as_str(), "%Y-%m-%d").ok());
    found
}

/// Agencies arrive under `agencies`, under `data`, or as a bare list.
fn parse_agencies(body: &str) -> anyhow::Result<Vec<AgencyRecord>> {
    let value: serde_json::Value = serde_json::from_str(body)?;
    let list = match value {
        serde_json::Value::Array(_) => value,
        serde_json::Value::Object(mut map) => map
            .remove("agencies")
            .or_else(|| map.remove("data"))
            .unwrap_or(serde_json::Value::Array(Vec::new())),
        _ => serde_json::Value::Array(Vec::new()),
    };
    Ok(serde_json::from_value(list)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifier_reads_issue_date() {
        let body = r#"{"error":"Bad Request","message":"The date requested 2025-01-31 is past the title's most recent issue date of 2025-01-27"}"#;
        assert_eq!(
            classify_content_error(body),
            NaiveDate::from_ymd_opt(2025, 1, 27)
        );
    }

    #[test]
    fn classifier_is_case_insensitive() {
        let body = "Requested date is past the Most Recent Issue Date: 2023-12-29.";
        assert_eq!(
            classify_content_error(body),
            NaiveDate::from_ymd_opt(2023, 12, 29)
        );
    }

    #[test]
    fn classifier_ignores_other_errors() {
        assert_eq!(classify_content_error("invalid part 2024-01-01"), None);
        assert_eq!(classify_content_error(""), None);
        assert_eq!(
            classify_content_error("past the most recent issue date (unknown)"),
            None
        );
    }

    #[test]
    fn classifier_gives_same_answer_on_repeated_calls() {
        let body = "past the most recent issue date of 2024-06-28";
        let first = classify_content_error(body);
        let second = classify_content_error(body);
        assert_eq!(first, NaiveDate::from_ymd_opt(2024, 6, 28));
        assert_eq!(first, second);
        assert_eq!(
            classify_content_error("most recent issue date 2024-07-01"),
            NaiveDate::from_ymd_opt(2024, 7, 1)
        );
    }

    #[test]
    fn classifier_skips_invalid_dates() {
        let body = "most recent issue date 2024-13-40 or 2024-02-01";
        assert_eq!(
            classify_content_error(body),
            NaiveDate::from_ymd_opt(2024, 2, 1)
        );
    }

    #[test]
    fn rate_limit_delay_bounds() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.rate_limit_delay(0.0), Duration::from_secs(10));
        assert_eq!(policy.rate_limit_delay(0.5), Duration::from_secs(15));
        assert!(policy.rate_limit_delay(0.999) < Duration::from_secs(20));
    }

    #[test]
    fn error_delay_scales_with_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.error_delay(1, 0.0), Duration::from_secs(10));
        assert_eq!(policy.error_delay(3, 0.0), Duration::from_secs(30));
        assert_eq!(policy.error_delay(2, 0.5), Duration::from_secs(30));
    }

    #[test]
    fn locator_omits_missing_levels() {
        let locator = ContentLocator {
            chapter: Some("I".into()),
            part: Some("52".into()),
            section: None,
            appendix: None,
        };
        assert_eq!(locator.query_pairs(), vec![("chapter", "I"), ("part", "52")]);
    }

    #[test]
    fn agencies_accept_every_envelope() {
        let wrapped = r#"{"agencies":[{"slug":"a","name":"A"}]}"#;
        let data = r#"{"data":[{"slug":"b"}]}"#;
        let bare = r#"[{"slug":"c"}]"#;
        assert_eq!(parse_agencies(wrapped).unwrap()[0].slug, "a");
        assert_eq!(parse_agencies(data).unwrap()[0].slug, "b");
        assert_eq!(parse_agencies(bare).unwrap()[0].slug, "c");
        assert!(parse_agencies(r#"{"other":1}"#).unwrap().is_empty());
    }
}
