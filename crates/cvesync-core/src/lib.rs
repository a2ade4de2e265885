// # cvesync-core
//
// Core library for the CVE feed synchronization engine.
//
// ## Architecture Overview
//
// This library keeps a local store of vulnerability records in step with an
// upstream paginated feed and answers filtered queries against it:
// - **FeedTransport**: Trait for a single-shot fetch of one upstream page
// - **FeedClient**: Page fetch with rate-limit handling and exponential backoff
// - **normalize**: Raw feed record → `CveRecord` (pure, no I/O)
// - **RecordStore**: Trait for the record collection (recency-upsert + query)
// - **SyncOrchestrator**: Drives the paginated fetch loop into the store
// - **SyncScheduler**: Recurring and manual triggers behind a single-flight gate
// - **api**: Handlers for the update and filter endpoints
//
// ## Design Principles
//
// 1. **Separation of Concerns**: Transports only fetch, the engine owns retry and scheduling
// 2. **Recency Wins**: A stored record is never replaced by an older-or-equal one
// 3. **Single Flight**: At most one sync runs at any time
// 4. **Library-First**: All functionality can be embedded; the daemon is a thin shell
// 5. **Partial Progress Is Kept**: Abandoned syncs leave upserted records in place

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod model;
pub mod normalize;
pub mod store;
pub mod traits;

// Re-export core types for convenience
pub use config::{
    CveSyncConfig, EngineConfig, FeedConfig, RetryPolicy, SchedulerConfig, StoreConfig,
};
pub use engine::{SchedulerState, SyncEvent, SyncOrchestrator, SyncScheduler, TriggerOrigin};
pub use error::{Error, Result};
pub use feed::FeedClient;
pub use model::{CveRecord, CvssVersion, SyncMode, SyncReport, SyncState, SyncStatus};
pub use store::{FileRecordStore, MemoryRecordStore};
pub use traits::{FeedTransport, RecordFilter, RecordStore, ScoreMatch, UpsertOutcome};
