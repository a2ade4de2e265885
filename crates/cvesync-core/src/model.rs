//! Domain types: the stored CVE record and the sync bookkeeping around it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Longest `lastModified` window the upstream accepts for incremental queries
pub const MAX_INCREMENTAL_WINDOW_DAYS: i64 = 120;

/// CVSS scoring scheme a base score was taken from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CvssVersion {
    #[serde(rename = "4.0")]
    V40,
    #[serde(rename = "3.1")]
    V31,
    #[serde(rename = "3.0")]
    V30,
    #[serde(rename = "2.0")]
    V2,
}

impl CvssVersion {
    /// Extraction order for `baseScore`: newest scoring standard first
    pub const PRIORITY: [CvssVersion; 4] = [
        CvssVersion::V40,
        CvssVersion::V31,
        CvssVersion::V30,
        CvssVersion::V2,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CvssVersion::V40 => "4.0",
            CvssVersion::V31 => "3.1",
            CvssVersion::V30 => "3.0",
            CvssVersion::V2 => "2.0",
        }
    }
}

impl std::fmt::Display for CvssVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical stored vulnerability record
///
/// `id` and `published` never change once stored. `last_modified` only moves
/// forward; see [`crate::traits::RecordStore::upsert`].
///
/// Everything the engine does not interpret (descriptions, references,
/// weaknesses, ...) travels in `attributes` and is flattened back into the
/// JSON object when the record is serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CveRecord {
    pub id: String,
    pub published: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    /// Severity in 0.0..=10.0; 0.0 when the source carried no metric
    pub base_score: f64,
    /// Scheme the score came from, `None` when no metric was present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cvss_version: Option<CvssVersion>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl CveRecord {
    /// Create a record with no score and no passthrough attributes
    pub fn new(
        id: impl Into<String>,
        published: DateTime<Utc>,
        last_modified: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            published,
            last_modified,
            base_score: 0.0,
            cvss_version: None,
            attributes: Map::new(),
        }
    }

    /// Set the base score and the scheme it came from
    pub fn with_score(mut self, base_score: f64, version: CvssVersion) -> Self {
        self.base_score = base_score;
        self.cvss_version = Some(version);
        self
    }

    /// Attach a passthrough attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Whether this record carried a severity metric
    pub fn is_scored(&self) -> bool {
        self.cvss_version.is_some()
    }
}

/// Which slice of the feed a sync walks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SyncMode {
    /// Every record the feed knows about
    Full,
    /// Only records modified inside `[since, until]`
    Incremental {
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    },
}

impl SyncMode {
    /// Incremental window ending now
    pub fn incremental_since(since: DateTime<Utc>) -> Self {
        SyncMode::Incremental {
            since,
            until: Utc::now(),
        }
    }

    /// Validate the window against the upstream limits
    pub fn validate(&self) -> Result<()> {
        if let SyncMode::Incremental { since, until } = self {
            if since > until {
                return Err(Error::invalid_input(format!(
                    "Incremental window starts after it ends ({} > {})",
                    since, until
                )));
            }
            if *until - *since > Duration::days(MAX_INCREMENTAL_WINDOW_DAYS) {
                return Err(Error::invalid_input(format!(
                    "Incremental window exceeds {} days",
                    MAX_INCREMENTAL_WINDOW_DAYS
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Full => f.write_str("full"),
            SyncMode::Incremental { since, until } => {
                write!(f, "incremental ({} .. {})", since.to_rfc3339(), until.to_rfc3339())
            }
        }
    }
}

/// Counters for one completed sync
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Records that changed the store (inserted + updated)
    pub records_processed: u64,
    pub records_inserted: u64,
    pub records_updated: u64,
    /// Raw records the normalizer refused
    pub records_skipped: u64,
    /// Upserts refused by the recency rule or failed in the store
    pub records_rejected: u64,
    /// Stored records that carried no severity metric
    pub records_unscored: u64,
    pub pages_fetched: u64,
    pub total_results: u64,
}

/// Outcome of the most recent sync
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncStatus {
    /// No sync has run since process start
    #[default]
    Never,
    InProgress,
    Success,
    Failure { error: String, fatal: bool },
}

/// Process-wide sync bookkeeping
///
/// Kept in memory only: everything here can be re-derived by running
/// another sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub last_sync_started_at: Option<DateTime<Utc>>,
    pub last_sync_completed_at: Option<DateTime<Utc>>,
    pub last_sync_status: SyncStatus,
    pub last_sync_mode: Option<SyncMode>,
    pub records_processed: u64,
    pub records_skipped: u64,
    pub records_rejected: u64,
    /// Start of the latest run that finished successfully
    pub last_success_started_at: Option<DateTime<Utc>>,
}

impl SyncState {
    pub(crate) fn begin(&mut self, mode: SyncMode, now: DateTime<Utc>) {
        self.last_sync_started_at = Some(now);
        self.last_sync_completed_at = None;
        self.last_sync_status = SyncStatus::InProgress;
        self.last_sync_mode = Some(mode);
        self.records_processed = 0;
        self.records_skipped = 0;
        self.records_rejected = 0;
    }

    pub(crate) fn record_progress(&mut self, report: &SyncReport) {
        self.records_processed = report.records_processed;
        self.records_skipped = report.records_skipped;
        self.records_rejected = report.records_rejected;
    }

    pub(crate) fn finish(&mut self, outcome: std::result::Result<&SyncReport, &Error>, now: DateTime<Utc>) {
        self.last_sync_completed_at = Some(now);
        match outcome {
            Ok(report) => {
                self.record_progress(report);
                self.last_sync_status = SyncStatus::Success;
                self.last_success_started_at = self.last_sync_started_at;
            }
            Err(e) => {
                self.last_sync_status = SyncStatus::Failure {
                    error: e.to_string(),
                    fatal: e.is_fatal(),
                };
            }
        }
    }

    /// Whether a sync is currently marked as running
    pub fn is_running(&self) -> bool {
        self.last_sync_status == SyncStatus::InProgress
    }
}
