//! Upstream feed access
//!
//! - [`page`]: wire schema of one feed page and the request that fetches it
//! - [`client`]: `FeedClient`, which wraps a [`crate::FeedTransport`] with
//!   per-page timeout, rate-limit waits and exponential backoff

pub mod client;
pub mod page;

pub use client::FeedClient;
pub use page::{
    FeedPage, MAX_PAGE_SIZE, PageRequest, RawCve, RawCvssData, RawCvssMetric, RawMetrics,
    RawRecord,
};
