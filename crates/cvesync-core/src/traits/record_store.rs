// # Record Store Trait
//
// Defines the interface for the CVE record collection.
//
// ## Purpose
//
// The record store is the only durable state of the system. It guarantees
// that replaying the feed never regresses a record:
// - One record per CVE id
// - A stored record is only replaced by a strictly newer `lastModified`
// - Queries return records ordered by id
//
// ## Implementations
//
// - Memory: `MemoryRecordStore` (tests, ephemeral deployments)
// - File: `FileRecordStore` (JSON snapshot with crash recovery)
//
// ## Usage
//
// ```rust,ignore
// use cvesync_core::{RecordFilter, RecordStore};
//
// #[tokio::main]
// async fn main() -> anyhow::Result<()> {
//     let store = /* RecordStore implementation */;
//
//     let outcome = store.upsert(record).await?;
//     let recent = store.query(&RecordFilter::new().modified_within_days(7, chrono::Utc::now())).await?;
//
//     Ok(())
// }
// ```

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::model::CveRecord;

/// Tolerance used when comparing scores for equality
const SCORE_EPSILON: f64 = 1e-6;

/// Result of a recency-upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First sighting of this id
    Inserted,
    /// Replaced a strictly older record
    Updated {
        /// `lastModified` of the record that was replaced
        previous_modified: DateTime<Utc>,
    },
    /// Stored record is as new or newer; the store is unchanged
    Rejected {
        /// `lastModified` of the record that was kept
        stored_modified: DateTime<Utc>,
    },
}

impl UpsertOutcome {
    /// Whether the store changed
    pub fn is_applied(&self) -> bool {
        !matches!(self, UpsertOutcome::Rejected { .. })
    }
}

/// Constraint on `baseScore`
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreMatch {
    /// Score equals the value
    Exact(f64),
    /// Score is at least the value
    AtLeast(f64),
}

impl ScoreMatch {
    pub fn matches(&self, score: f64) -> bool {
        match self {
            ScoreMatch::Exact(target) => (score - target).abs() < SCORE_EPSILON,
            ScoreMatch::AtLeast(threshold) => score + SCORE_EPSILON >= *threshold,
        }
    }
}

/// Conjunction of optional constraints; an empty filter matches everything
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    /// Exact id match
    pub id: Option<String>,
    /// Score constraint
    pub base_score: Option<ScoreMatch>,
    /// Only records with `lastModified >= modified_since`
    pub modified_since: Option<DateTime<Utc>>,
}

impl RecordFilter {
    /// Create an empty filter
    pub fn new() -> Self {
        Self::default()
    }

    /// Require an exact id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Require a score constraint
    pub fn with_base_score(mut self, score: ScoreMatch) -> Self {
        self.base_score = Some(score);
        self
    }

    /// Require `lastModified >= now - days`
    ///
    /// A window reaching past the earliest representable instant covers
    /// every record, so it leaves the filter unbounded.
    pub fn modified_within_days(mut self, days: u32, now: DateTime<Utc>) -> Self {
        self.modified_since =
            Duration::try_days(i64::from(days)).and_then(|window| now.checked_sub_signed(window));
        self
    }

    /// Whether no constraint is set
    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.base_score.is_none() && self.modified_since.is_none()
    }

    /// Evaluate the filter against one record
    pub fn matches(&self, record: &CveRecord) -> bool {
        if let Some(ref id) = self.id
            && record.id != *id
        {
            return false;
        }
        if let Some(score) = self.base_score
            && !score.matches(record.base_score)
        {
            return false;
        }
        if let Some(since) = self.modified_since
            && record.last_modified < since
        {
            return false;
        }
        true
    }
}

/// Trait for record store implementations
///
/// # Thread Safety
///
/// All methods must be safe to call concurrently from many tasks. A write
/// to one id must not block reads of, or writes to, a different id; writes
/// to the same id are serialized.
///
/// # Error Contract
///
/// - `Error::Store`: the operation failed for this record only; the caller
///   counts it and moves on
/// - `Error::StoreUnavailable`: the store cannot be used any more; the
///   caller abandons the sync
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or replace a record under the recency rule
    ///
    /// The incoming record replaces the stored one only when its
    /// `last_modified` is strictly newer. Replaying the same or an older
    /// snapshot is therefore a no-op that returns `Rejected`.
    ///
    /// # Parameters
    ///
    /// - `record`: The normalized record
    ///
    /// # Returns
    ///
    /// - `Ok(UpsertOutcome)`: What happened to the store
    /// - `Err(Error)`: Storage error
    async fn upsert(&self, record: CveRecord) -> Result<UpsertOutcome, crate::Error>;

    /// Get a single record by id
    ///
    /// # Returns
    ///
    /// - `Ok(Some(CveRecord))`: The stored record
    /// - `Ok(None)`: No record with this id
    /// - `Err(Error)`: Storage error
    async fn get(&self, id: &str) -> Result<Option<CveRecord>, crate::Error>;

    /// Return all records matching the filter, ordered by id ascending
    ///
    /// There is no implicit limit.
    async fn query(&self, filter: &RecordFilter) -> Result<Vec<CveRecord>, crate::Error>;

    /// Number of stored records
    async fn count(&self) -> Result<usize, crate::Error>;

    /// Persist any pending changes
    ///
    /// Some implementations may buffer writes. This ensures
    /// all changes are flushed to persistent storage.
    async fn flush(&self) -> Result<(), crate::Error>;
}
