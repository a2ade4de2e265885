//! Page fetch with retry and backoff.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::page::{FeedPage, MAX_PAGE_SIZE, PageRequest};
use crate::config::RetryPolicy;
use crate::error::{Error, Result};
use crate::traits::FeedTransport;

/// Fetches single pages from a [`FeedTransport`], absorbing rate limiting
/// and transient failures
///
/// Every attempt runs under `request_timeout`. Rate-limit signals and
/// transient errors share one budget of `1 + max_retries` attempts; once it
/// is spent the last failure is surfaced as `Error::TransientFetch`. Fatal
/// errors are returned on the first occurrence.
///
/// The client keeps no state between calls.
pub struct FeedClient {
    transport: Arc<dyn FeedTransport>,
    retry: RetryPolicy,
    request_timeout: Duration,
}

impl FeedClient {
    /// Create a new feed client
    ///
    /// # Parameters
    ///
    /// - `transport`: Single-shot page fetcher
    /// - `retry`: Attempt budget and delays
    /// - `request_timeout`: Bound on each individual attempt
    pub fn new(
        transport: Arc<dyn FeedTransport>,
        retry: RetryPolicy,
        request_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            retry,
            request_timeout,
        }
    }

    /// Name of the underlying transport
    pub fn transport_name(&self) -> &'static str {
        self.transport.transport_name()
    }

    /// Fetch one page
    ///
    /// # Returns
    ///
    /// - `Ok(FeedPage)`: The decoded page
    /// - `Err(Error::InvalidInput)`: `page_size` is 0 or above the upstream maximum
    /// - `Err(Error::TransientFetch)`: Retry budget exhausted
    /// - `Err(Error::FatalFetch)`: Non-retryable upstream failure
    /// - `Err(Error::Cancelled)`: `cancel` fired while waiting
    pub async fn fetch_page(
        &self,
        request: &PageRequest,
        cancel: &CancellationToken,
    ) -> Result<FeedPage> {
        if request.page_size == 0 || request.page_size > MAX_PAGE_SIZE {
            return Err(Error::invalid_input(format!(
                "Page size must be between 1 and {} (got {})",
                MAX_PAGE_SIZE, request.page_size
            )));
        }

        let total_attempts = self.retry.max_retries.saturating_add(1);

        for attempt in 0..total_attempts {
            let err = match self.attempt(request, cancel).await {
                Ok(page) => return Ok(page),
                Err(e) => e,
            };

            let delay = match &err {
                Error::RateLimited { retry_after, .. } => self.retry.rate_limit_delay(*retry_after),
                Error::TransientFetch(_) => self.retry.delay_for_retry(attempt),
                _ => return Err(err),
            };

            if attempt + 1 >= total_attempts {
                warn!(
                    "Giving up on page at startIndex {} after {} attempts: {}",
                    request.start_index, total_attempts, err
                );
                return Err(match err {
                    Error::RateLimited { message, .. } => Error::transient(format!(
                        "rate limit persisted after {} attempts: {}",
                        total_attempts, message
                    )),
                    other => other,
                });
            }

            warn!(
                "Retryable error (attempt {}/{}), retrying in {}ms: {}",
                attempt + 1,
                total_attempts,
                delay.as_millis(),
                err
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::cancelled("shutdown requested during retry wait"));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        // Only reachable with a zero attempt budget, which saturating_add rules out
        Err(Error::transient("no fetch attempt was made"))
    }

    async fn attempt(&self, request: &PageRequest, cancel: &CancellationToken) -> Result<FeedPage> {
        debug!(
            "Fetching page via {}: startIndex={} resultsPerPage={}",
            self.transport.transport_name(),
            request.start_index,
            request.page_size
        );

        tokio::select! {
            _ = cancel.cancelled() => Err(Error::cancelled("shutdown requested during page fetch")),
            result = tokio::time::timeout(self.request_timeout, self.transport.fetch_page(request)) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(Error::transient(format!(
                        "page request timed out after {}ms",
                        self.request_timeout.as_millis()
                    ))),
                }
            }
        }
    }
}

impl std::fmt::Debug for FeedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedClient")
            .field("transport", &self.transport.transport_name())
            .field("retry", &self.retry)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}
