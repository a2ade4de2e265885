// # NVD Feed Transport
//
// This crate provides a `FeedTransport` for the NVD CVE API 2.0.
//
// ## Behaviour
//
// - One HTTP request per `fetch_page` call
// - Every failure is classified for the engine (rate limited, transient, fatal)
// - No retry, backoff or pacing: `FeedClient` and `SyncOrchestrator` own those
// - No state between calls
//
// ## Security Requirements
//
// - The API key NEVER appears in logs or `Debug` output
// - The API key is sent as the `apiKey` header, never in the URL
//
// ## API Reference
//
// - CVE API 2.0: https://nvd.nist.gov/developers/vulnerabilities
// - `GET /rest/json/cves/2.0?startIndex=..&resultsPerPage=..`
// - Incremental: `lastModStartDate` / `lastModEndDate`, both required, at most 120 days apart
// - Rolling-window limits: 5 requests per 30 s without a key, 50 with one

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use cvesync_core::config::FeedConfig;
use cvesync_core::feed::{FeedPage, PageRequest};
use cvesync_core::{Error, FeedTransport, Result};
use reqwest::StatusCode;
use reqwest::header::RETRY_AFTER;
use std::time::Duration;

/// Header carrying the NVD API key
const API_KEY_HEADER: &str = "apiKey";

/// Longest error body excerpt kept in error messages
const MAX_ERROR_BODY: usize = 200;

/// NVD CVE API 2.0 transport
///
/// # Security
///
/// The Debug implementation does NOT expose the API key.
pub struct NvdTransport {
    /// Endpoint, e.g. `https://services.nvd.nist.gov/rest/json/cves/2.0`
    url: String,

    /// API key
    /// ⚠️ NEVER log this value
    api_key: Option<String>,

    /// HTTP client for API requests
    client: reqwest::Client,
}

// Custom Debug implementation that hides the API key
impl std::fmt::Debug for NvdTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvdTransport")
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<REDACTED>"))
            .finish()
    }
}

impl NvdTransport {
    /// Create a transport from the feed configuration
    ///
    /// # Returns
    ///
    /// - `Ok(NvdTransport)`: Ready to fetch
    /// - `Err(Error::Config)`: Invalid configuration, or the HTTP client could not be built
    pub fn new(config: &FeedConfig) -> Result<Self> {
        config.validate()?;

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("cvesync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            url: config.url.clone(),
            api_key: config.api_key.clone(),
            client,
        })
    }

    /// Whether requests carry an API key
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

#[async_trait]
impl FeedTransport for NvdTransport {
    /// Fetch one page of the CVE API
    ///
    /// # API Call
    ///
    /// ```http
    /// GET /rest/json/cves/2.0?startIndex=0&resultsPerPage=2000
    /// apiKey: <key>
    /// ```
    async fn fetch_page(&self, request: &PageRequest) -> Result<FeedPage> {
        let mut builder = self.client.get(&self.url).query(&query_pairs(request));
        if let Some(key) = &self.api_key {
            builder = builder.header(API_KEY_HEADER, key);
        }

        let response = builder.send().await.map_err(|e| {
            Error::transient(format!("HTTP request to NVD failed: {}", without_url(e)))
        })?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, Utc::now()));

        let body = response.text().await.map_err(|e| {
            Error::transient(format!("Failed to read NVD response body: {}", without_url(e)))
        })?;

        if !status.is_success() {
            return Err(classify_status(status, retry_after, self.has_api_key(), &body));
        }

        let page = decode_page(&body)?;
        tracing::debug!(
            "NVD page at startIndex {}: {} records, totalResults {}",
            request.start_index,
            page.vulnerabilities.len(),
            page.total_results
        );
        Ok(page)
    }

    fn transport_name(&self) -> &'static str {
        "nvd"
    }
}

/// Query parameters for one page request
fn query_pairs(request: &PageRequest) -> Vec<(&'static str, String)> {
    let mut pairs = vec![
        ("startIndex", request.start_index.to_string()),
        ("resultsPerPage", request.page_size.to_string()),
    ];
    if let Some((since, until)) = request.modified_window {
        pairs.push(("lastModStartDate", format_timestamp(since)));
        pairs.push(("lastModEndDate", format_timestamp(until)));
    }
    pairs
}

/// ISO-8601 with milliseconds in UTC, as the API expects
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Decode a 2xx body
///
/// A body that is not a page is fatal. Individual entries that do not match
/// the schema come back marked malformed and are skipped downstream.
fn decode_page(body: &str) -> Result<FeedPage> {
    serde_json::from_str(body).map_err(|e| {
        Error::fatal(format!(
            "NVD response does not match the page schema: {}",
            e
        ))
    })
}

/// Map a non-success status onto the error taxonomy
fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    has_api_key: bool,
    body: &str,
) -> Error {
    let detail = excerpt(body);
    match status.as_u16() {
        429 => Error::rate_limited(format!("NVD returned {}", status), retry_after),
        // Any status carrying Retry-After is a request to back off
        _ if retry_after.is_some() => {
            Error::rate_limited(format!("NVD returned {}", status), retry_after)
        }
        // NVD answers throttled anonymous clients with 403
        403 if !has_api_key => Error::rate_limited(
            format!("NVD returned {} for an anonymous client", status),
            retry_after,
        ),
        401 | 403 => Error::fatal(format!("NVD rejected the API key: {}", status)),
        408 | 500..=599 => Error::transient(format!("NVD server error {}: {}", status, detail)),
        _ => Error::fatal(format!("Unexpected NVD response {}: {}", status, detail)),
    }
}

/// Parse a `Retry-After` value (delta-seconds or HTTP-date)
fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(MAX_ERROR_BODY) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

/// reqwest errors embed the request URL; keep messages short and stable
fn without_url(err: reqwest::Error) -> reqwest::Error {
    err.without_url()
}
