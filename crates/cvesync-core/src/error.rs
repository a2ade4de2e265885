//! Error types for the CVE sync engine
//!
//! This module defines all error types used throughout the crate. The
//! variants follow the sync taxonomy: page-level transient and fatal fetch
//! failures, per-record store failures, and the store becoming unreachable.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for sync engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the CVE sync engine
#[derive(Error, Debug)]
pub enum Error {
    /// Retryable upstream failure (network, 5xx, exhausted rate limiting)
    #[error("Transient fetch error: {0}")]
    TransientFetch(String),

    /// Non-retryable upstream failure (malformed response, unexpected status)
    #[error("Fatal fetch error: {0}")]
    FatalFetch(String),

    /// Upstream asked us to slow down
    ///
    /// Only transports produce this; `FeedClient` consumes it and converts
    /// it into `TransientFetch` once the retry budget is spent.
    #[error("Rate limited: {message}")]
    RateLimited {
        /// Description of the rate-limit signal
        message: String,
        /// Delay requested by the upstream, if any
        retry_after: Option<Duration>,
    },

    /// Store failure affecting a single record
    #[error("Record store error: {0}")]
    Store(String),

    /// The store can no longer be used at all
    #[error("Record store unavailable: {0}")]
    StoreUnavailable(String),

    /// A sync is already running (single-flight rejection)
    #[error("A CVE synchronization is already in progress")]
    SyncInProgress,

    /// Work stopped because shutdown was requested
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Filesystem errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a transient fetch error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientFetch(msg.into())
    }

    /// Create a fatal fetch error
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::FatalFetch(msg.into())
    }

    /// Create a rate limit error
    pub fn rate_limited(msg: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::RateLimited {
            message: msg.into(),
            retry_after,
        }
    }

    /// Create a per-record store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a store-unavailable error
    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    /// Create a cancellation error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether `FeedClient` may retry the same page after this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientFetch(_) | Self::RateLimited { .. })
    }

    /// Whether this error abandons a sync without hope of a retry helping
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::FatalFetch(_) | Self::StoreUnavailable(_) | Self::InvalidInput(_) | Self::Config(_)
        )
    }

    /// Whether an upsert failure must abort the sync instead of being counted
    pub fn escalates_store_failure(&self) -> bool {
        !matches!(self, Self::Store(_))
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
