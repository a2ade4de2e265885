// # Feed Transport Trait
//
// Defines the interface for fetching one page of the upstream vulnerability feed.
//
// ## Implementations
//
// - NVD CVE API 2.0: `cvesync-feed-nvd` crate
// - Test doubles: scripted transports in `tests/common`
//
// ## Usage
//
// ```rust,ignore
// use cvesync_core::feed::PageRequest;
// use cvesync_core::FeedTransport;
//
// #[tokio::main]
// async fn main() -> anyhow::Result<()> {
//     let transport = /* FeedTransport implementation */;
//
//     let page = transport.fetch_page(&PageRequest::new(0, 2000)).await?;
//     println!("{} records upstream", page.total_results);
//
//     Ok(())
// }
// ```

use async_trait::async_trait;

use crate::feed::{FeedPage, PageRequest};

/// Trait for upstream feed transports
///
/// A transport performs exactly one request per call and reports what
/// happened. Everything around the call belongs to the engine:
///
/// ## Allowed
/// - One HTTP request to the feed endpoint per invocation
/// - Decoding the response into [`FeedPage`]
/// - Classifying failures into the error taxonomy
///
/// ## Not Allowed
/// - Retrying or sleeping (owned by `FeedClient`)
/// - Touching the record store (owned by `SyncOrchestrator`)
/// - Spawning tasks or keeping state between calls
///
/// ## Error Classification
///
/// - `Error::RateLimited { retry_after }`: upstream asked us to slow down
/// - `Error::TransientFetch`: network failure, timeout, server error
/// - `Error::FatalFetch`: unexpected status or a body that does not match the schema
#[async_trait]
pub trait FeedTransport: Send + Sync {
    /// Fetch a single page
    ///
    /// # Parameters
    ///
    /// - `request`: Offset, page size and optional modification window
    ///
    /// # Returns
    ///
    /// - `Ok(FeedPage)`: The decoded page
    /// - `Err(Error)`: A classified failure (see trait docs)
    async fn fetch_page(&self, request: &PageRequest) -> Result<FeedPage, crate::Error>;

    /// Get the transport name (for logging/debugging)
    fn transport_name(&self) -> &'static str;
}
