//! Test doubles and common utilities for sync contract tests
//!
//! These doubles script the upstream feed and the record store so that each
//! contract can be checked without network access or wall-clock waits.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cvesync_core::error::{Error, Result};
use cvesync_core::feed::{FeedPage, PageRequest, RawCve, RawRecord};
use cvesync_core::traits::{FeedTransport, RecordFilter, RecordStore, UpsertOutcome};
use cvesync_core::{
    CveRecord, CveSyncConfig, MemoryRecordStore, RetryPolicy, SyncEvent, SyncOrchestrator,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore, mpsc};

/// Failure injected for every request at a given `startIndex`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    Transient,
    Fatal,
}

/// A synthetic feed of `total` records with sequential ids
///
/// Record `i` has id `CVE-2024-{i:05}`. Every request is recorded.
pub struct SyntheticFeed {
    total: u64,
    published: String,
    last_modified: String,
    missing_ids: HashSet<u64>,
    total_change: Option<(usize, u64)>,
    failure: Option<(u64, InjectedFailure)>,
    requests: Mutex<Vec<PageRequest>>,
}

impl SyntheticFeed {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            published: "2024-01-01T00:00:00.000".into(),
            last_modified: "2024-02-01T00:00:00.000".into(),
            missing_ids: HashSet::new(),
            total_change: None,
            failure: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Use this `lastModified` for every record
    pub fn with_last_modified(mut self, last_modified: &str) -> Self {
        self.last_modified = last_modified.to_string();
        self
    }

    /// Serve records at these indices without an id
    pub fn with_missing_ids(mut self, indices: impl IntoIterator<Item = u64>) -> Self {
        self.missing_ids = indices.into_iter().collect();
        self
    }

    /// Report `new_total` on every page after the first `pages` pages
    pub fn with_total_changing_after(mut self, pages: usize, new_total: u64) -> Self {
        self.total_change = Some((pages, new_total));
        self
    }

    /// Fail every request for the page at `start_index`
    pub fn with_failure_at(mut self, start_index: u64, failure: InjectedFailure) -> Self {
        self.failure = Some((start_index, failure));
        self
    }

    pub fn requests(&self) -> Vec<PageRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn start_indices(&self) -> Vec<u64> {
        self.requests().iter().map(|r| r.start_index).collect()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn raw(&self, index: u64) -> RawRecord {
        RawRecord::from_cve(RawCve {
            id: if self.missing_ids.contains(&index) {
                None
            } else {
                Some(cve_id(index))
            },
            published: Some(self.published.clone()),
            last_modified: Some(self.last_modified.clone()),
            ..Default::default()
        })
    }
}

#[async_trait]
impl FeedTransport for SyntheticFeed {
    async fn fetch_page(&self, request: &PageRequest) -> Result<FeedPage> {
        let pages_served = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(*request);
            requests.len() - 1
        };

        if let Some((start_index, failure)) = self.failure
            && start_index == request.start_index
        {
            return Err(match failure {
                InjectedFailure::Transient => Error::transient("503 Service Unavailable"),
                InjectedFailure::Fatal => Error::fatal("response body did not match the page schema"),
            });
        }

        let total = match self.total_change {
            Some((pages, new_total)) if pages_served >= pages => new_total,
            _ => self.total,
        };

        let end = (request.start_index + u64::from(request.page_size)).min(self.total);
        let vulnerabilities = (request.start_index..end).map(|i| self.raw(i)).collect();

        Ok(FeedPage {
            total_results: total,
            results_per_page: Some(u64::from(request.page_size)),
            start_index: Some(request.start_index),
            timestamp: None,
            vulnerabilities,
        })
    }

    fn transport_name(&self) -> &'static str {
        "synthetic"
    }
}

/// A feed that answers every request with a rate-limit signal
#[derive(Default)]
pub struct RateLimitedFeed {
    calls: AtomicUsize,
}

impl RateLimitedFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedTransport for RateLimitedFeed {
    async fn fetch_page(&self, _request: &PageRequest) -> Result<FeedPage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::rate_limited("429 Too Many Requests", None))
    }

    fn transport_name(&self) -> &'static str {
        "rate-limited"
    }
}

/// A single-page feed decoded from a literal upstream body
pub struct JsonFeed {
    body: String,
    calls: AtomicUsize,
}

impl JsonFeed {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedTransport for JsonFeed {
    async fn fetch_page(&self, _request: &PageRequest) -> Result<FeedPage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        serde_json::from_str(&self.body)
            .map_err(|e| Error::fatal(format!("response body did not match the page schema: {}", e)))
    }

    fn transport_name(&self) -> &'static str {
        "json"
    }
}

/// Wraps a feed and parks every request until the test releases it
pub struct GatedFeed {
    inner: SyntheticFeed,
    arrivals: AtomicUsize,
    entered: Notify,
    release: Semaphore,
}

impl GatedFeed {
    pub fn new(inner: SyntheticFeed) -> Self {
        Self {
            inner,
            arrivals: AtomicUsize::new(0),
            entered: Notify::new(),
            release: Semaphore::new(0),
        }
    }

    /// Wait until `count` requests in total have reached the gate
    pub async fn wait_for_requests(&self, count: usize) {
        loop {
            // Registered before the check so that a concurrent arrival is not missed
            let notified = self.entered.notified();
            if self.arrivals.load(Ordering::SeqCst) >= count {
                return;
            }
            notified.await;
        }
    }

    /// Let `pages` requests through
    pub fn release(&self, pages: usize) {
        self.release.add_permits(pages);
    }

    pub fn calls(&self) -> usize {
        self.inner.calls()
    }

    pub fn start_indices(&self) -> Vec<u64> {
        self.inner.start_indices()
    }
}

#[async_trait]
impl FeedTransport for GatedFeed {
    async fn fetch_page(&self, request: &PageRequest) -> Result<FeedPage> {
        self.arrivals.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_waiters();
        let permit = self
            .release
            .acquire()
            .await
            .map_err(|_| Error::transient("gate closed"))?;
        permit.forget();
        self.inner.fetch_page(request).await
    }

    fn transport_name(&self) -> &'static str {
        "gated"
    }
}

/// Record store that fails upserts on demand
pub struct FailingStore {
    inner: MemoryRecordStore,
    failing_ids: HashSet<String>,
    unavailable_after: Option<usize>,
    fail_queries: bool,
    upserts: AtomicUsize,
}

impl FailingStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryRecordStore::new(),
            failing_ids: HashSet::new(),
            unavailable_after: None,
            fail_queries: false,
            upserts: AtomicUsize::new(0),
        }
    }

    /// Fail upserts of these ids with a per-record `Error::Store`
    pub fn failing_ids(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.failing_ids = ids.into_iter().collect();
        self
    }

    /// Report the store as unreachable after `upserts` successful upserts
    pub fn unavailable_after(mut self, upserts: usize) -> Self {
        self.unavailable_after = Some(upserts);
        self
    }

    /// Fail every query with `Error::StoreUnavailable`
    pub fn failing_queries(mut self) -> Self {
        self.fail_queries = true;
        self
    }
}

#[async_trait]
impl RecordStore for FailingStore {
    async fn upsert(&self, record: CveRecord) -> Result<UpsertOutcome> {
        if self.failing_ids.contains(&record.id) {
            return Err(Error::store(format!("write of {} failed", record.id)));
        }
        let done = self.upserts.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.unavailable_after
            && done >= limit
        {
            return Err(Error::store_unavailable("connection to store lost"));
        }
        self.inner.upsert(record).await
    }

    async fn get(&self, id: &str) -> Result<Option<CveRecord>> {
        self.inner.get(id).await
    }

    async fn query(&self, filter: &RecordFilter) -> Result<Vec<CveRecord>> {
        if self.fail_queries {
            return Err(Error::store_unavailable("query backend offline"));
        }
        self.inner.query(filter).await
    }

    async fn count(&self) -> Result<usize> {
        self.inner.count().await
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Id of synthetic record `index`
pub fn cve_id(index: u64) -> String {
    format!("CVE-2024-{:05}", index)
}

/// Config with no delays and no retries
pub fn test_config(page_size: u32) -> CveSyncConfig {
    let mut config = CveSyncConfig::new();
    config.feed.page_size = page_size;
    config.feed.page_delay_ms = Some(0);
    config.feed.retry = RetryPolicy::immediate(0);
    config
}

/// Build an orchestrator over a transport and store
pub fn orchestrator(
    transport: Arc<dyn FeedTransport>,
    store: Arc<dyn RecordStore>,
    config: &CveSyncConfig,
) -> (SyncOrchestrator, mpsc::Receiver<SyncEvent>) {
    SyncOrchestrator::new(transport, store, config).expect("orchestrator construction succeeds")
}

/// A stored record built directly, bypassing the normalizer
pub fn record(id: &str, last_modified: DateTime<Utc>) -> CveRecord {
    CveRecord::new(id, last_modified, last_modified)
}

/// Drain every event currently buffered
pub fn drain_events(rx: &mut mpsc::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
