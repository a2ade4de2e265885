// # File Record Store
//
// File-backed implementation of RecordStore with crash recovery.
//
// ## Purpose
//
// Keeps the record collection across daemon restarts so that a restart does
// not require a full re-sync before queries return data.
//
// ## Write Path
//
// Upserts go to an in-memory working set and mark the store dirty. `flush()`
// writes a snapshot of the whole collection:
//
// - Atomic writes: snapshot written to a temporary file, then renamed
// - Backup: the previous snapshot is copied to `.backup` before the rename
// - Recovery: a snapshot that fails to decode is replaced by the backup
//
// The orchestrator flushes at the end of every sync; the daemon flushes on
// shutdown.
//
// ## File Format
//
// ```json
// {
//   "version": "1.0",
//   "records": [
//     {
//       "id": "CVE-2021-44228",
//       "published": "2021-12-10T10:15:09.143Z",
//       "lastModified": "2024-02-04T09:15:09.113Z",
//       "baseScore": 10.0,
//       "cvssVersion": "3.1",
//       "descriptions": [...]
//     }
//   ]
// }
// ```

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::memory::MemoryRecordStore;
use crate::Error;
use crate::model::CveRecord;
use crate::traits::record_store::{RecordFilter, RecordStore, UpsertOutcome};

/// Snapshot file format version
const SNAPSHOT_VERSION: &str = "1.0";

/// File-backed record store with crash recovery
///
/// # Example
///
/// ```rust,no_run
/// use cvesync_core::{FileRecordStore, RecordStore};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = FileRecordStore::open("/var/lib/cvesync/records.json").await?;
///     println!("{} records loaded", store.count().await?);
///
///     // ... upserts ...
///
///     store.flush().await?;
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct FileRecordStore {
    path: PathBuf,
    records: MemoryRecordStore,
    dirty: AtomicBool,
    /// Serializes snapshot writers
    write_lock: Mutex<()>,
}

#[derive(serde::Serialize)]
struct SnapshotOut<'a> {
    version: &'a str,
    records: &'a [CveRecord],
}

#[derive(serde::Deserialize)]
struct SnapshotIn {
    version: String,
    records: Vec<CveRecord>,
}

impl FileRecordStore {
    /// Open or create a file record store
    ///
    /// This will:
    /// 1. Create parent directories if needed
    /// 2. Load the existing snapshot, if any
    /// 3. Fall back to the backup if the snapshot does not decode
    /// 4. Start empty if neither can be used
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).await.map_err(|e| {
                Error::config(format!(
                    "Failed to create store directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let records = Self::load_with_recovery(&path).await?;
        tracing::info!(
            "Opened file record store at {} ({} records)",
            path.display(),
            records.len()
        );

        Ok(Self {
            path,
            records: MemoryRecordStore::from_records(records)?,
            dirty: AtomicBool::new(false),
            write_lock: Mutex::new(()),
        })
    }

    /// Path of the snapshot file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether there are changes not yet written to disk
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    async fn load_with_recovery(path: &Path) -> Result<Vec<CveRecord>, Error> {
        match Self::load(path).await {
            Ok(records) => Ok(records),
            Err(Error::Json(e)) => {
                tracing::warn!(
                    "Record snapshot appears corrupted: {}. Attempting recovery from backup.",
                    e
                );

                let backup_path = Self::backup_path(path);
                if !backup_path.exists() {
                    tracing::warn!("No backup file found. Starting with an empty store.");
                    return Ok(Vec::new());
                }

                match Self::load(&backup_path).await {
                    Ok(records) => {
                        tracing::info!("Recovered {} records from backup", records.len());
                        if let Err(restore_err) = fs::copy(&backup_path, path).await {
                            tracing::error!(
                                "Failed to restore snapshot from backup: {}",
                                restore_err
                            );
                        }
                        Ok(records)
                    }
                    Err(backup_err) => {
                        tracing::error!(
                            "Backup also unusable: {}. Starting with an empty store.",
                            backup_err
                        );
                        Ok(Vec::new())
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn load(path: &Path) -> Result<Vec<CveRecord>, Error> {
        if !path.exists() {
            tracing::debug!("Record snapshot does not exist: {}", path.display());
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(path).await.map_err(|e| {
            Error::store_unavailable(format!(
                "Failed to read record snapshot {}: {}",
                path.display(),
                e
            ))
        })?;

        let snapshot: SnapshotIn = serde_json::from_str(&content)?;
        if snapshot.version != SNAPSHOT_VERSION {
            tracing::warn!(
                "Record snapshot version mismatch: expected {}, got {}. Attempting to load anyway.",
                SNAPSHOT_VERSION,
                snapshot.version
            );
        }

        Ok(snapshot.records)
    }

    async fn write_snapshot(&self) -> Result<(), Error> {
        let _guard = self.write_lock.lock().await;

        // Cleared before the snapshot is taken so that concurrent upserts re-mark it
        self.dirty.store(false, Ordering::SeqCst);

        let result = self.write_snapshot_locked().await;
        if result.is_err() {
            self.dirty.store(true, Ordering::SeqCst);
        }
        result
    }

    async fn write_snapshot_locked(&self) -> Result<(), Error> {
        let records = self.records.snapshot()?;
        let json = serde_json::to_vec_pretty(&SnapshotOut {
            version: SNAPSHOT_VERSION,
            records: &records,
        })?;

        let temp_path = self.temp_path();
        {
            let mut file = fs::File::create(&temp_path).await.map_err(|e| {
                Error::store_unavailable(format!(
                    "Failed to create temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            file.write_all(&json).await.map_err(|e| {
                Error::store_unavailable(format!(
                    "Failed to write temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            file.sync_all().await.map_err(|e| {
                Error::store_unavailable(format!(
                    "Failed to sync temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
        }

        if self.path.exists()
            && let Err(e) = fs::copy(&self.path, Self::backup_path(&self.path)).await
        {
            tracing::warn!("Failed to create snapshot backup: {}", e);
        }

        fs::rename(&temp_path, &self.path).await.map_err(|e| {
            Error::store_unavailable(format!(
                "Failed to rename {} to {}: {}",
                temp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        tracing::debug!(
            "Wrote {} records to {}",
            records.len(),
            self.path.display()
        );
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone();
        temp.set_extension("tmp");
        temp
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut backup = path.to_path_buf();
        backup.set_extension("backup");
        backup
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn upsert(&self, record: CveRecord) -> Result<UpsertOutcome, Error> {
        let outcome = self.records.apply_upsert(record)?;
        if outcome.is_applied() {
            self.dirty.store(true, Ordering::SeqCst);
        }
        Ok(outcome)
    }

    async fn get(&self, id: &str) -> Result<Option<CveRecord>, Error> {
        self.records.get(id).await
    }

    async fn query(&self, filter: &RecordFilter) -> Result<Vec<CveRecord>, Error> {
        self.records.query(filter).await
    }

    async fn count(&self) -> Result<usize, Error> {
        self.records.count().await
    }

    async fn flush(&self) -> Result<(), Error> {
        if self.is_dirty() {
            self.write_snapshot().await
        } else {
            Ok(())
        }
    }
}
