//! Core traits for the CVE sync engine
//!
//! This module defines the abstract interfaces that all implementations must follow.
//!
//! - [`FeedTransport`]: Fetch one page of the upstream feed
//! - [`RecordStore`]: Hold CVE records under the recency-upsert rule and answer queries

pub mod feed_transport;
pub mod record_store;

pub use feed_transport::FeedTransport;
pub use record_store::{RecordFilter, RecordStore, ScoreMatch, UpsertOutcome};
