// # cvesyncd - CVE Sync Daemon
//
// This daemon is a THIN integration layer:
// - No paging, retry or recency logic here; all of it lives in cvesync-core
// - Configuration is via environment variables ONLY
//
// The cvesyncd daemon is responsible for:
// 1. Reading configuration from environment variables
// 2. Initializing logging and the runtime
// 3. Building the record store and the feed transport
// 4. Running the scheduler until a shutdown signal arrives
//
// ## Configuration
//
// ### Feed
// - `CVESYNC_FEED_URL`: Feed endpoint (default: NVD CVE API 2.0)
// - `CVESYNC_API_KEY`: NVD API key (optional, raises the rate limit)
// - `CVESYNC_PAGE_SIZE`: Records per page, 1-2000 (default: 2000)
// - `CVESYNC_MAX_RETRIES`: Retry budget per page (default: 3)
//
// ### Record Store
// - `CVESYNC_STORE_TYPE`: Type of record store (memory, file)
// - `CVESYNC_STORE_PATH`: Path to the snapshot file (for file store)
//
// ### Scheduler
// - `CVESYNC_SYNC_INTERVAL_SECS`: Time between automatic syncs (default: 86400)
// - `CVESYNC_STARTUP_DELAY_SECS`: Delay before the first sync (default: 0)
// - `CVESYNC_INCREMENTAL`: Use lastModified windows after a success (default: false)
//
// ### Logging
// - `CVESYNC_LOG_LEVEL`: trace, debug, info, warn, error (default: info)
//
// ## Signals
//
// - `SIGTERM` / `SIGINT`: Stop the scheduler, wait for the running sync, flush
// - `SIGUSR1`: Trigger a manual sync (rejected while one is running)
//
// ## Example
//
// ```bash
// export CVESYNC_API_KEY=your_key
// export CVESYNC_STORE_TYPE=file
// export CVESYNC_STORE_PATH=/var/lib/cvesync/records.json
// export CVESYNC_SYNC_INTERVAL_SECS=7200
// export CVESYNC_INCREMENTAL=true
//
// cvesyncd
// ```

use anyhow::Result;
use cvesync_core::config::DEFAULT_FEED_URL;
use cvesync_core::{
    CveSyncConfig, FeedTransport, FileRecordStore, MemoryRecordStore, RecordStore, StoreConfig,
    SyncEvent, SyncOrchestrator, SyncScheduler, api,
};
use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum CveSyncExitCode {
    CleanShutdown = 0,
    ConfigError = 1,
    RuntimeError = 2,
}

impl From<CveSyncExitCode> for ExitCode {
    fn from(code: CveSyncExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Raw settings read from the environment
struct Config {
    feed_url: String,
    api_key: Option<String>,
    page_size: Option<u32>,
    max_retries: Option<u32>,
    store_type: String,
    store_path: Option<String>,
    sync_interval_secs: Option<u64>,
    startup_delay_secs: Option<u64>,
    incremental: bool,
    log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Ok(Self {
            feed_url: env::var("CVESYNC_FEED_URL").unwrap_or_else(|_| DEFAULT_FEED_URL.to_string()),
            api_key: env::var("CVESYNC_API_KEY").ok().filter(|k| !k.is_empty()),
            page_size: parse_var("CVESYNC_PAGE_SIZE")?,
            max_retries: parse_var("CVESYNC_MAX_RETRIES")?,
            store_type: env::var("CVESYNC_STORE_TYPE").unwrap_or_else(|_| "memory".to_string()),
            store_path: env::var("CVESYNC_STORE_PATH").ok(),
            sync_interval_secs: parse_var("CVESYNC_SYNC_INTERVAL_SECS")?,
            startup_delay_secs: parse_var("CVESYNC_STARTUP_DELAY_SECS")?,
            incremental: parse_var::<bool>("CVESYNC_INCREMENTAL")?.unwrap_or(false),
            log_level: env::var("CVESYNC_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Check daemon-level settings and build the engine configuration
    ///
    /// Value ranges are checked by `CveSyncConfig::validate`.
    fn into_sync_config(self) -> Result<(CveSyncConfig, Level)> {
        let log_level = match self.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => anyhow::bail!(
                "CVESYNC_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        };

        let store = match self.store_type.as_str() {
            "memory" => StoreConfig::Memory,
            "file" => match self.store_path {
                Some(path) if !path.is_empty() => StoreConfig::File { path },
                _ => anyhow::bail!(
                    "CVESYNC_STORE_PATH is required when CVESYNC_STORE_TYPE=file. \
                    Set it via: export CVESYNC_STORE_PATH=/var/lib/cvesync/records.json"
                ),
            },
            other => anyhow::bail!(
                "CVESYNC_STORE_TYPE '{}' is not supported. \
                Supported types: memory, file",
                other
            ),
        };

        if self.feed_url.starts_with("http://") {
            eprintln!(
                "WARNING: CVESYNC_FEED_URL uses HTTP (not HTTPS). \
                The API key would travel in clear text."
            );
        }

        let mut config = CveSyncConfig::new();
        config.feed.url = self.feed_url;
        config.feed.api_key = self.api_key;
        if let Some(page_size) = self.page_size {
            config.feed.page_size = page_size;
        }
        if let Some(max_retries) = self.max_retries {
            config.feed.retry.max_retries = max_retries;
        }
        config.store = store;
        if let Some(interval) = self.sync_interval_secs {
            config.scheduler.interval_secs = interval;
        }
        if let Some(delay) = self.startup_delay_secs {
            config.scheduler.startup_delay_secs = delay;
        }
        config.scheduler.incremental = self.incremental;

        config.validate()?;
        Ok((config, log_level))
    }
}

/// Parse an optional environment variable, failing on malformed values
fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{} has an invalid value '{}': {}", name, raw, e)),
        Err(_) => Ok(None),
    }
}

fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return CveSyncExitCode::ConfigError.into();
        }
    };

    let (config, log_level) = match config.into_sync_config() {
        Ok(parts) => parts,
        Err(e) => {
            eprintln!("Configuration validation error: {}", e);
            return CveSyncExitCode::ConfigError.into();
        }
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return CveSyncExitCode::ConfigError.into();
    }

    info!("Starting cvesyncd daemon");
    info!(
        "Feed: {} (API key: {}), store: {}, interval: {}s",
        config.feed.url,
        if config.feed.api_key.is_some() { "set" } else { "none" },
        config.store.type_name(),
        config.scheduler.interval_secs
    );

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return CveSyncExitCode::RuntimeError.into();
        }
    };

    rt.block_on(async {
        match build_scheduler(&config).await {
            Ok(scheduler) => match run_daemon(scheduler).await {
                Ok(()) => CveSyncExitCode::CleanShutdown,
                Err(e) => {
                    error!("Daemon error: {}", e);
                    CveSyncExitCode::RuntimeError
                }
            },
            Err(e) => {
                error!("Startup error: {}", e);
                CveSyncExitCode::ConfigError
            }
        }
    })
    .into()
}

/// Build the store, the transport and the engine, and start draining events
async fn build_scheduler(config: &CveSyncConfig) -> Result<Arc<SyncScheduler>> {
    let store: Arc<dyn RecordStore> = match &config.store {
        StoreConfig::Memory => Arc::new(MemoryRecordStore::new()),
        StoreConfig::File { path } => {
            let store = FileRecordStore::open(path).await?;
            info!("Loaded {} record(s) from {}", store.count().await?, path);
            Arc::new(store)
        }
    };

    let transport = build_transport(config)?;
    info!("Feed transport: {}", transport.transport_name());

    let (orchestrator, events) = SyncOrchestrator::new(transport, store, config)?;
    tokio::spawn(log_events(ReceiverStream::new(events)));

    Ok(Arc::new(SyncScheduler::new(
        orchestrator,
        config.scheduler.clone(),
    )?))
}

#[cfg(feature = "nvd")]
fn build_transport(config: &CveSyncConfig) -> Result<Arc<dyn FeedTransport>> {
    Ok(Arc::new(cvesync_feed_nvd::NvdTransport::new(&config.feed)?))
}

#[cfg(not(feature = "nvd"))]
fn build_transport(_config: &CveSyncConfig) -> Result<Arc<dyn FeedTransport>> {
    anyhow::bail!("cvesyncd was built without a feed transport; enable the `nvd` feature")
}

/// Log every engine event until the orchestrator is dropped
async fn log_events(mut events: ReceiverStream<SyncEvent>) {
    while let Some(event) = events.next().await {
        match event {
            SyncEvent::SyncStarted { mode } => info!("Sync started ({:?})", mode),
            SyncEvent::PageFetched {
                start_index,
                records,
                total_results,
            } => debug!(
                "Page at {} fetched: {} record(s) of {}",
                start_index, records, total_results
            ),
            SyncEvent::RecordSkipped { id, reason } => debug!(
                "Record {} skipped: {}",
                id.as_deref().unwrap_or("<no id>"),
                reason
            ),
            SyncEvent::SyncCompleted { report } => info!(
                "Sync completed: {} processed ({} new, {} updated), {} skipped, {} rejected",
                report.records_processed,
                report.records_inserted,
                report.records_updated,
                report.records_skipped,
                report.records_rejected
            ),
            SyncEvent::SyncFailed {
                error,
                fatal,
                report,
            } => {
                let kind = if fatal { "fatal" } else { "retryable" };
                error!(
                    "Sync failed ({}) after {} record(s): {}",
                    kind, report.records_processed, error
                )
            }
            SyncEvent::TriggerRejected { origin } => {
                warn!("{} sync trigger rejected: a sync is already running", origin)
            }
        }
    }
}

/// Run the scheduler until a shutdown signal arrives
async fn run_daemon(scheduler: Arc<SyncScheduler>) -> Result<()> {
    scheduler.start()?;
    info!("Scheduler started");

    let outcome = wait_for_shutdown(scheduler.clone()).await;

    match outcome {
        Ok(name) => info!("Received shutdown signal: {}", name),
        Err(ref e) => error!("Signal handling error: {}", e),
    }

    info!("Stopping scheduler");
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, scheduler.stop())
        .await
        .is_err()
    {
        anyhow::bail!("Shutdown timeout after {:?}", SHUTDOWN_TIMEOUT);
    }

    // No-op when the last run already persisted everything
    scheduler.orchestrator().store().flush().await?;
    info!("Shut down cleanly");

    outcome.map(|_| ())
}

/// Upper bound on waiting for the running sync during shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Wait for SIGTERM or SIGINT, serving SIGUSR1 as a manual trigger meanwhile
#[cfg(unix)]
async fn wait_for_shutdown(scheduler: Arc<SyncScheduler>) -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;
    let mut sigusr1 = signal(SignalKind::user_defined1())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGUSR1 handler: {}", e))?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => return Ok("SIGTERM"),
            _ = sigint.recv() => return Ok("SIGINT"),
            _ = sigusr1.recv() => {
                info!("SIGUSR1: manual sync requested");
                let scheduler = scheduler.clone();
                tokio::spawn(async move {
                    let response = api::update_cve_data(&scheduler).await;
                    if response.is_success() {
                        info!("Manual sync: {}", response.body);
                    } else {
                        warn!("Manual sync ({}): {}", response.status_code, response.body);
                    }
                });
            }
        }
    }
}

/// Wait for CTRL-C
///
/// Fallback implementation for non-Unix platforms; no manual trigger signal.
#[cfg(not(unix))]
async fn wait_for_shutdown(_scheduler: Arc<SyncScheduler>) -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}
