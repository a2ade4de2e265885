//! CVE synchronization engine
//!
//! The [`SyncOrchestrator`] is responsible for:
//! - Walking the upstream feed page by page via [`FeedClient`]
//! - Normalizing every raw record
//! - Upserting records under the recency rule
//! - Tracking the outcome in [`SyncState`]
//!
//! The [`SyncScheduler`] decides *when* a sync runs: on a fixed interval and
//! on demand, never more than one at a time.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐  timer / trigger
//! │ SyncScheduler │──────────────────┐
//! └───────────────┘                  │
//!                                    ▼
//!                          ┌──────────────────┐
//!                          │ SyncOrchestrator │
//!                          └──────────────────┘
//!                                    │
//!         ┌──────────────────────────┼──────────────────────────┐
//!         │                          │                          │
//!         ▼                          ▼                          ▼
//! ┌──────────────┐          ┌────────────────┐          ┌─────────────┐
//! │  FeedClient  │          │  RecordStore   │          │   Events    │
//! │ (fetch page) │          │ (upsert)       │          │  (notify)   │
//! └──────────────┘          └────────────────┘          └─────────────┘
//! ```
//!
//! ## Page Flow
//!
//! 1. Fetch the page at `startIndex`
//! 2. Check `totalResults` against the first page
//! 3. Normalize and upsert each record, counting outcomes
//! 4. Advance `startIndex` by the page size until it reaches `totalResults`
//! 5. Flush the store and record the outcome

pub mod scheduler;

pub use scheduler::{SchedulerState, SyncScheduler, TriggerOrigin};

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CveSyncConfig;
use crate::error::{Error, Result};
use crate::feed::{FeedClient, PageRequest, RawRecord};
use crate::model::{SyncMode, SyncReport, SyncState};
use crate::normalize::{Normalized, normalize};
use crate::traits::{FeedTransport, RecordStore, UpsertOutcome};

/// Events emitted by the sync engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A sync run began
    SyncStarted { mode: SyncMode },

    /// One page was fetched and is about to be ingested
    PageFetched {
        start_index: u64,
        records: usize,
        total_results: u64,
    },

    /// The normalizer refused a raw record
    RecordSkipped { id: Option<String>, reason: String },

    /// A sync run walked the whole feed
    SyncCompleted { report: SyncReport },

    /// A sync run was abandoned; records upserted so far are kept
    SyncFailed {
        error: String,
        fatal: bool,
        report: SyncReport,
    },

    /// A trigger arrived while a sync was running and was dropped
    TriggerRejected { origin: TriggerOrigin },
}

/// Drives one sync run from the first page to the last
///
/// ## Lifecycle
///
/// 1. Create with [`SyncOrchestrator::new()`]
/// 2. Hand it to a [`SyncScheduler`], or call [`SyncOrchestrator::run_sync()`] directly
/// 3. Drain the event receiver for monitoring
///
/// `run_sync` itself does not guard against overlapping calls; the
/// scheduler's single-flight gate does.
pub struct SyncOrchestrator {
    /// Page fetcher with retry
    client: FeedClient,

    /// Record collection
    store: Arc<dyn RecordStore>,

    /// Process-wide sync bookkeeping
    state: RwLock<SyncState>,

    /// Records requested per page
    page_size: u32,

    /// Pause between consecutive page requests
    page_delay: Duration,

    /// Event sender for external monitoring
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncOrchestrator {
    /// Create a new orchestrator
    ///
    /// # Parameters
    ///
    /// - `transport`: Single-shot feed transport
    /// - `store`: Record store implementation
    /// - `config`: Sync configuration (feed and engine sections are used)
    ///
    /// # Returns
    ///
    /// A tuple of (orchestrator, event_receiver) where event_receiver yields sync events
    pub fn new(
        transport: Arc<dyn FeedTransport>,
        store: Arc<dyn RecordStore>,
        config: &CveSyncConfig,
    ) -> Result<(Self, mpsc::Receiver<SyncEvent>)> {
        config.feed.validate()?;
        config.engine.validate()?;

        let (tx, rx) = mpsc::channel(config.engine.event_channel_capacity);

        let orchestrator = Self {
            client: FeedClient::new(
                transport,
                config.feed.retry.clone(),
                config.feed.request_timeout(),
            ),
            store,
            state: RwLock::new(SyncState::default()),
            page_size: config.feed.page_size,
            page_delay: config.feed.effective_page_delay(),
            event_tx: tx,
        };

        Ok((orchestrator, rx))
    }

    /// Snapshot of the sync bookkeeping
    pub fn state(&self) -> SyncState {
        self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// The record store this orchestrator writes to
    pub fn store(&self) -> Arc<dyn RecordStore> {
        Arc::clone(&self.store)
    }

    /// Run one sync to completion
    ///
    /// Pages are fetched sequentially in index order. `cancel` stops the
    /// run before the next page fetch; records already upserted stay.
    ///
    /// # Returns
    ///
    /// - `Ok(SyncReport)`: Every page was ingested
    /// - `Err(Error::TransientFetch)`: A page could not be fetched; a later run may succeed
    /// - `Err(Error::FatalFetch)`: The feed misbehaved (bad shape, inconsistent total)
    /// - `Err(Error::StoreUnavailable)`: The store stopped accepting writes
    /// - `Err(Error::Cancelled)`: `cancel` fired
    /// - `Err(Error::InvalidInput)`: The incremental window is invalid; nothing was fetched
    pub async fn run_sync(&self, mode: SyncMode, cancel: &CancellationToken) -> Result<SyncReport> {
        mode.validate()?;

        self.update_state(|state| state.begin(mode, Utc::now()));
        self.emit_event(SyncEvent::SyncStarted { mode });
        info!(
            "Starting {} sync via {} ({} records per page)",
            mode,
            self.client.transport_name(),
            self.page_size
        );

        let mut report = SyncReport::default();
        let walked = self.walk_feed(mode, cancel, &mut report).await;

        let outcome = match (walked, self.store.flush().await) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(flush_err)) => Err(match flush_err {
                Error::StoreUnavailable(_) => flush_err,
                other => Error::store_unavailable(format!("flush failed: {}", other)),
            }),
            (Err(e), Err(flush_err)) => {
                error!("Failed to flush record store after abandoned sync: {}", flush_err);
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        };

        match outcome {
            Ok(()) => {
                self.update_state(|state| state.finish(Ok(&report), Utc::now()));
                info!(
                    "Sync completed: {} processed ({} inserted, {} updated), {} skipped, {} rejected, {} unscored, {} pages",
                    report.records_processed,
                    report.records_inserted,
                    report.records_updated,
                    report.records_skipped,
                    report.records_rejected,
                    report.records_unscored,
                    report.pages_fetched
                );
                self.emit_event(SyncEvent::SyncCompleted {
                    report: report.clone(),
                });
                Ok(report)
            }
            Err(e) => {
                self.update_state(|state| {
                    state.record_progress(&report);
                    state.finish(Err(&e), Utc::now());
                });
                if matches!(e, Error::Cancelled(_)) {
                    warn!(
                        "Sync cancelled after {} pages ({} records processed)",
                        report.pages_fetched, report.records_processed
                    );
                } else {
                    error!(
                        "Sync abandoned after {} pages ({} records processed): {}",
                        report.pages_fetched, report.records_processed, e
                    );
                }
                self.emit_event(SyncEvent::SyncFailed {
                    error: e.to_string(),
                    fatal: e.is_fatal(),
                    report,
                });
                Err(e)
            }
        }
    }

    async fn walk_feed(
        &self,
        mode: SyncMode,
        cancel: &CancellationToken,
        report: &mut SyncReport,
    ) -> Result<()> {
        let mut start_index: u64 = 0;
        let mut expected_total: Option<u64> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::cancelled(format!(
                    "shutdown requested before fetching startIndex {}",
                    start_index
                )));
            }

            if start_index > 0 && !self.page_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(Error::cancelled(format!(
                            "shutdown requested before fetching startIndex {}",
                            start_index
                        )));
                    }
                    _ = tokio::time::sleep(self.page_delay) => {}
                }
            }

            let mut request = PageRequest::new(start_index, self.page_size);
            if let SyncMode::Incremental { since, until } = mode {
                request = request.with_modified_window(since, until);
            }

            let page = self.client.fetch_page(&request, cancel).await?;
            report.pages_fetched += 1;

            let total = page.total_results;
            match expected_total {
                None => {
                    expected_total = Some(total);
                    report.total_results = total;
                }
                Some(expected) if expected != total => {
                    return Err(Error::fatal(format!(
                        "totalResults changed mid-sync: first page reported {}, page at startIndex {} reported {}",
                        expected, start_index, total
                    )));
                }
                Some(_) => {}
            }

            debug!(
                "Fetched page at startIndex {}: {} records of {}",
                start_index,
                page.vulnerabilities.len(),
                total
            );
            self.emit_event(SyncEvent::PageFetched {
                start_index,
                records: page.vulnerabilities.len(),
                total_results: total,
            });

            for raw in page.vulnerabilities {
                self.ingest(raw, report).await?;
            }
            self.update_state(|state| state.record_progress(report));

            start_index += u64::from(self.page_size);
            if start_index >= total {
                return Ok(());
            }
        }
    }

    async fn ingest(&self, raw: RawRecord, report: &mut SyncReport) -> Result<()> {
        let record = match normalize(raw) {
            Normalized::Record(record) => record,
            Normalized::Skipped(signal) => {
                report.records_skipped += 1;
                warn!(
                    "Skipping record {}: {}",
                    signal.id.as_deref().unwrap_or("<no id>"),
                    signal.reason
                );
                self.emit_event(SyncEvent::RecordSkipped {
                    id: signal.id,
                    reason: signal.reason.to_string(),
                });
                return Ok(());
            }
        };

        let id = record.id.clone();
        let scored = record.is_scored();

        match self.store.upsert(record).await {
            Ok(UpsertOutcome::Inserted) => {
                report.records_inserted += 1;
                report.records_processed += 1;
                if !scored {
                    report.records_unscored += 1;
                }
            }
            Ok(UpsertOutcome::Updated { .. }) => {
                report.records_updated += 1;
                report.records_processed += 1;
                if !scored {
                    report.records_unscored += 1;
                }
            }
            Ok(UpsertOutcome::Rejected { .. }) => {
                report.records_rejected += 1;
            }
            Err(e) if !e.escalates_store_failure() => {
                report.records_rejected += 1;
                warn!("Failed to store {}: {}", id, e);
            }
            Err(e) => {
                error!("Record store failed while storing {}: {}", id, e);
                return Err(match e {
                    Error::StoreUnavailable(_) => e,
                    other => Error::store_unavailable(other.to_string()),
                });
            }
        }

        Ok(())
    }

    fn update_state(&self, f: impl FnOnce(&mut SyncState)) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut state);
    }

    /// Emit an event to the event channel
    ///
    /// A full channel drops the event with a warning. Once the receiver is
    /// gone, events are discarded quietly.
    pub(crate) fn emit_event(&self, event: SyncEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("Event channel full, dropping event. Consider increasing event_channel_capacity.");
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Event receiver dropped, discarding event");
            }
        }
    }
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("client", &self.client)
            .field("page_size", &self.page_size)
            .field("page_delay", &self.page_delay)
            .finish_non_exhaustive()
    }
}
