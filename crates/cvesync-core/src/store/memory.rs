// # Memory Record Store
//
// In-memory implementation of RecordStore.
//
// ## Purpose
//
// Holds the record collection in process memory. Used directly in tests and
// ephemeral deployments, and as the working set of `FileRecordStore`.
//
// ## Locking
//
// - Ids are spread over a fixed set of shards, each an `RwLock` around an
//   id → slot map; adding a new id write-locks only its shard
// - Each record lives in its own `Mutex` slot; upserts to one id serialize
//   on that slot and never block other ids
// - Queries copy slot handles under short shard read locks and release them
//   before touching any record
// - Locks are synchronous and never held across an `.await`
//
// ## Crash Behavior
//
// - All records are lost on restart
// - The next full sync repopulates the store

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, RwLock};

use crate::Error;
use crate::model::CveRecord;
use crate::traits::record_store::{RecordFilter, RecordStore, UpsertOutcome};

/// Number of independently locked shards
const SHARD_COUNT: usize = 16;

type Slot = Arc<Mutex<CveRecord>>;
type Shard = RwLock<BTreeMap<String, Slot>>;

/// In-memory record store implementation
///
/// # Example
///
/// ```rust,no_run
/// use chrono::Utc;
/// use cvesync_core::{CveRecord, MemoryRecordStore, RecordFilter, RecordStore};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = MemoryRecordStore::new();
///
///     store.upsert(CveRecord::new("CVE-2024-0001", Utc::now(), Utc::now())).await?;
///
///     let all = store.query(&RecordFilter::new()).await?;
///     assert_eq!(all.len(), 1);
///
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct MemoryRecordStore {
    shards: Vec<Shard>,
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::default()).collect(),
        }
    }
}

impl MemoryRecordStore {
    /// Create a new empty memory record store
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from existing records, applying the recency rule to duplicates
    pub fn from_records(records: impl IntoIterator<Item = CveRecord>) -> Result<Self, Error> {
        let store = Self::new();
        for record in records {
            store.apply_upsert(record)?;
        }
        Ok(store)
    }

    /// Synchronous recency-upsert
    pub fn apply_upsert(&self, record: CveRecord) -> Result<UpsertOutcome, Error> {
        if let Some(slot) = self.existing_slot(&record.id)? {
            return Self::apply_to_slot(&slot, record);
        }

        let mut shard = self
            .shard_for(&record.id)
            .write()
            .map_err(|_| Error::store_unavailable("record map lock poisoned"))?;

        // Another writer may have inserted the id between the two locks
        if let Some(slot) = shard.get(&record.id).cloned() {
            drop(shard);
            return Self::apply_to_slot(&slot, record);
        }

        shard.insert(record.id.clone(), Arc::new(Mutex::new(record)));
        Ok(UpsertOutcome::Inserted)
    }

    /// Copy of every record, ordered by id
    pub fn snapshot(&self) -> Result<Vec<CveRecord>, Error> {
        self.collect(&RecordFilter::new())
    }

    fn shard_for(&self, id: &str) -> &Shard {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    fn existing_slot(&self, id: &str) -> Result<Option<Slot>, Error> {
        let shard = self
            .shard_for(id)
            .read()
            .map_err(|_| Error::store_unavailable("record map lock poisoned"))?;
        Ok(shard.get(id).cloned())
    }

    /// Handles to every slot, ordered by id; no shard lock is held on return
    fn all_slots(&self) -> Result<Vec<(String, Slot)>, Error> {
        let mut slots = Vec::new();
        for shard in &self.shards {
            let shard = shard
                .read()
                .map_err(|_| Error::store_unavailable("record map lock poisoned"))?;
            slots.extend(shard.iter().map(|(id, slot)| (id.clone(), slot.clone())));
        }
        slots.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        Ok(slots)
    }

    fn apply_to_slot(slot: &Slot, incoming: CveRecord) -> Result<UpsertOutcome, Error> {
        let mut stored = slot
            .lock()
            .map_err(|_| Error::store(format!("record slot for {} poisoned", incoming.id)))?;

        if incoming.last_modified <= stored.last_modified {
            return Ok(UpsertOutcome::Rejected {
                stored_modified: stored.last_modified,
            });
        }

        let previous_modified = stored.last_modified;
        let published = stored.published;
        *stored = incoming;
        stored.published = published;

        Ok(UpsertOutcome::Updated { previous_modified })
    }

    fn read_slot(id: &str, slot: &Slot) -> Result<CveRecord, Error> {
        let record = slot
            .lock()
            .map_err(|_| Error::store(format!("record slot for {} poisoned", id)))?;
        Ok(record.clone())
    }

    fn collect(&self, filter: &RecordFilter) -> Result<Vec<CveRecord>, Error> {
        // Exact id needs no scan
        if let Some(id) = &filter.id {
            let Some(slot) = self.existing_slot(id)? else {
                return Ok(Vec::new());
            };
            let record = Self::read_slot(id, &slot)?;
            return Ok(if filter.matches(&record) {
                vec![record]
            } else {
                Vec::new()
            });
        }

        let mut out = Vec::new();
        for (id, slot) in self.all_slots()? {
            let record = Self::read_slot(&id, &slot)?;
            if filter.matches(&record) {
                out.push(record);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn upsert(&self, record: CveRecord) -> Result<UpsertOutcome, Error> {
        self.apply_upsert(record)
    }

    async fn get(&self, id: &str) -> Result<Option<CveRecord>, Error> {
        match self.existing_slot(id)? {
            Some(slot) => Ok(Some(Self::read_slot(id, &slot)?)),
            None => Ok(None),
        }
    }

    async fn query(&self, filter: &RecordFilter) -> Result<Vec<CveRecord>, Error> {
        self.collect(filter)
    }

    async fn count(&self) -> Result<usize, Error> {
        let mut total = 0;
        for shard in &self.shards {
            total += shard
                .read()
                .map_err(|_| Error::store_unavailable("record map lock poisoned"))?
                .len();
        }
        Ok(total)
    }

    async fn flush(&self) -> Result<(), Error> {
        // Memory store has nothing to flush
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CvssVersion;
    use crate::traits::ScoreMatch;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, 0, 0, 0).unwrap()
    }

    fn record(id: &str, modified: u32) -> CveRecord {
        CveRecord::new(id, ts(1), ts(modified))
    }

    #[tokio::test]
    async fn test_memory_store_basic() {
        let store = MemoryRecordStore::new();
        assert_eq!(store.count().await.unwrap(), 0);

        let outcome = store.upsert(record("CVE-2024-0001", 2)).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);

        let stored = store.get("CVE-2024-0001").await.unwrap().unwrap();
        assert_eq!(stored.last_modified, ts(2));
        assert!(store.get("CVE-2024-9999").await.unwrap().is_none());
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_newer_replaces_older() {
        let store = MemoryRecordStore::new();
        store.upsert(record("CVE-1", 2)).await.unwrap();

        let newer = record("CVE-1", 5).with_score(8.1, CvssVersion::V31);
        let outcome = store.upsert(newer).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated { previous_modified: ts(2) });

        let stored = store.get("CVE-1").await.unwrap().unwrap();
        assert_eq!(stored.last_modified, ts(5));
        assert_eq!(stored.base_score, 8.1);
    }

    #[tokio::test]
    async fn test_equal_or_older_is_rejected() {
        let store = MemoryRecordStore::new();
        store.upsert(record("CVE-1", 5).with_score(9.0, CvssVersion::V31)).await.unwrap();

        let same = store.upsert(record("CVE-1", 5)).await.unwrap();
        let older = store.upsert(record("CVE-1", 3)).await.unwrap();
        assert_eq!(same, UpsertOutcome::Rejected { stored_modified: ts(5) });
        assert_eq!(older, UpsertOutcome::Rejected { stored_modified: ts(5) });

        let stored = store.get("CVE-1").await.unwrap().unwrap();
        assert_eq!(stored.base_score, 9.0);
    }

    #[tokio::test]
    async fn test_published_is_immutable() {
        let store = MemoryRecordStore::new();
        store.upsert(record("CVE-1", 2)).await.unwrap();

        let mut rewritten = record("CVE-1", 6);
        rewritten.published = ts(4);
        store.upsert(rewritten).await.unwrap();

        let stored = store.get("CVE-1").await.unwrap().unwrap();
        assert_eq!(stored.published, ts(1));
        assert_eq!(stored.last_modified, ts(6));
    }

    #[tokio::test]
    async fn test_query_is_ordered_by_id() {
        let store = MemoryRecordStore::new();
        for id in ["CVE-2024-0003", "CVE-2023-0001", "CVE-2024-0002"] {
            store.upsert(record(id, 2)).await.unwrap();
        }

        let ids: Vec<String> = store
            .query(&RecordFilter::new())
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["CVE-2023-0001", "CVE-2024-0002", "CVE-2024-0003"]);
    }

    #[tokio::test]
    async fn test_query_by_id_and_score() {
        let store = MemoryRecordStore::new();
        store.upsert(record("CVE-1", 2).with_score(9.8, CvssVersion::V31)).await.unwrap();
        store.upsert(record("CVE-2", 2).with_score(4.3, CvssVersion::V2)).await.unwrap();

        let by_id = store.query(&RecordFilter::new().with_id("CVE-2")).await.unwrap();
        assert_eq!(by_id.len(), 1);
        assert_eq!(by_id[0].id, "CVE-2");

        let none = store
            .query(&RecordFilter::new().with_id("CVE-2").with_base_score(ScoreMatch::AtLeast(7.0)))
            .await
            .unwrap();
        assert!(none.is_empty());

        let high = store
            .query(&RecordFilter::new().with_base_score(ScoreMatch::AtLeast(7.0)))
            .await
            .unwrap();
        assert_eq!(high.len(), 1);
        assert_eq!(high[0].id, "CVE-1");
    }

    #[test]
    fn test_from_records_keeps_newest_duplicate() {
        let store =
            MemoryRecordStore::from_records(vec![record("CVE-1", 4), record("CVE-1", 2)]).unwrap();
        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].last_modified, ts(4));
    }

    #[tokio::test]
    async fn test_concurrent_upserts_same_id() {
        let store = Arc::new(MemoryRecordStore::new());
        let mut handles = Vec::new();
        for day in 1..=20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.upsert(record("CVE-1", day)).await.unwrap()
            }));
        }

        let mut inserted = 0;
        for handle in handles {
            if handle.await.unwrap() == UpsertOutcome::Inserted {
                inserted += 1;
            }
        }

        assert_eq!(inserted, 1);
        let stored = store.get("CVE-1").await.unwrap().unwrap();
        assert_eq!(stored.last_modified, ts(20));
    }

    #[test]
    fn test_insert_only_locks_its_own_shard() {
        let store = Arc::new(MemoryRecordStore::new());
        let held = "CVE-2024-0001".to_string();
        let other = (2..)
            .map(|n| format!("CVE-2024-{:04}", n))
            .find(|id| !std::ptr::eq(store.shard_for(id), store.shard_for(&held)))
            .unwrap();

        let _guard = store.shard_for(&held).write().unwrap();

        let (tx, rx) = mpsc::channel();
        let writer = store.clone();
        thread::spawn(move || {
            let outcome = writer.apply_upsert(record(&other, 2)).unwrap();
            let stored = writer.collect(&RecordFilter::new().with_id(other.as_str())).unwrap();
            tx.send((outcome, stored.len())).unwrap();
        });

        let (outcome, found) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);
        assert_eq!(found, 1);
    }

    #[test]
    fn test_scan_waiting_on_a_record_does_not_block_inserts() {
        let store = Arc::new(MemoryRecordStore::new());
        store.apply_upsert(record("CVE-1", 2)).unwrap();
        let slot = store.existing_slot("CVE-1").unwrap().unwrap();
        let busy = slot.lock().unwrap();

        let reader = store.clone();
        let scan = thread::spawn(move || reader.snapshot().unwrap().len());
        thread::sleep(Duration::from_millis(50));

        let (tx, rx) = mpsc::channel();
        let writer = store.clone();
        thread::spawn(move || {
            for n in 2..=40 {
                writer.apply_upsert(record(&format!("CVE-{}", n), 2)).unwrap();
            }
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        drop(busy);
        assert!(scan.join().unwrap() >= 1);
        assert_eq!(store.snapshot().unwrap().len(), 40);
    }
}
