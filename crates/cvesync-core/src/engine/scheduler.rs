//! Recurring and on-demand sync scheduling
//!
//! ## State Machine
//!
//! ```text
//!            timer fires / trigger()
//!   ┌──────┐ ───────────────────────▶ ┌─────────┐
//!   │ Idle │                          │ Running │ ──┐ timer fires / trigger()
//!   └──────┘ ◀─────────────────────── └─────────┘ ◀─┘ rejected, not queued
//!              run_sync returns
//! ```
//!
//! Every run that starts, manual or automatic, moves the next automatic tick
//! to `run start + interval`. A failing feed is therefore retried once per
//! interval, never in a tight loop.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{SyncEvent, SyncOrchestrator};
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::model::{MAX_INCREMENTAL_WINDOW_DAYS, SyncMode, SyncReport, SyncState};

/// Where a sync request came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOrigin {
    /// `SyncScheduler::trigger()`
    Manual,
    /// The interval timer
    Timer,
}

impl std::fmt::Display for TriggerOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerOrigin::Manual => f.write_str("manual"),
            TriggerOrigin::Timer => f.write_str("timer"),
        }
    }
}

/// Scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
}

/// Runs syncs on a fixed interval and on demand, at most one at a time
///
/// ## Lifecycle
///
/// 1. Create with [`SyncScheduler::new()`]
/// 2. [`SyncScheduler::start()`] spawns the interval timer; the first tick
///    fires after `startup_delay`
/// 3. [`SyncScheduler::trigger()`] runs a sync right away, with or without
///    the timer
/// 4. [`SyncScheduler::stop()`] cancels the timer and any sync in flight and
///    waits for both to wind down
///
/// A stopped scheduler cannot be started again.
pub struct SyncScheduler {
    core: Arc<SchedulerCore>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

struct SchedulerCore {
    orchestrator: SyncOrchestrator,
    config: SchedulerConfig,
    /// Single-flight gate; held for the whole run
    gate: tokio::sync::Mutex<()>,
    /// Deadline of the next automatic tick, `None` until started
    next_tick: watch::Sender<Option<Instant>>,
    /// Cancels the timer and every sync it or `trigger()` starts
    shutdown: CancellationToken,
}

impl SyncScheduler {
    /// Create a new scheduler in the `Idle` state with no timer running
    pub fn new(orchestrator: SyncOrchestrator, config: SchedulerConfig) -> Result<Self> {
        config.validate()?;

        let (next_tick, _) = watch::channel(None);
        Ok(Self {
            core: Arc::new(SchedulerCore {
                orchestrator,
                config,
                gate: tokio::sync::Mutex::new(()),
                next_tick,
                shutdown: CancellationToken::new(),
            }),
            timer: Mutex::new(None),
        })
    }

    /// Spawn the interval timer
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Returns
    ///
    /// - `Ok(())`: Timer running
    /// - `Err(Error::InvalidInput)`: Already started, or stopped
    pub fn start(&self) -> Result<()> {
        if self.core.shutdown.is_cancelled() {
            return Err(Error::invalid_input("Scheduler has been stopped"));
        }

        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if timer.is_some() {
            return Err(Error::invalid_input("Scheduler is already started"));
        }

        let first_tick = Instant::now() + self.core.config.startup_delay();
        self.core.next_tick.send_replace(Some(first_tick));

        info!(
            "Scheduler started: first sync in {}s, then every {}s{}",
            self.core.config.startup_delay_secs,
            self.core.config.interval_secs,
            if self.core.config.incremental { " (incremental)" } else { "" }
        );

        *timer = Some(tokio::spawn(timer_loop(Arc::clone(&self.core))));
        Ok(())
    }

    /// Stop the timer and any sync in flight
    ///
    /// The running sync stops before its next page fetch. Records already
    /// upserted stay in the store.
    pub async fn stop(&self) {
        self.core.shutdown.cancel();

        let handle = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!("Scheduler timer task ended abnormally: {}", e);
        }

        // Wait for a manual run to release the gate
        let _gate = self.core.gate.lock().await;
        self.core.next_tick.send_replace(None);
        info!("Scheduler stopped");
    }

    /// Run a sync now and wait for it to finish
    ///
    /// # Returns
    ///
    /// - `Ok(SyncReport)`: The sync completed
    /// - `Err(Error::SyncInProgress)`: Another sync holds the gate; nothing was started
    /// - `Err(Error)`: The sync was abandoned (see [`SyncOrchestrator::run_sync`])
    pub async fn trigger(&self) -> Result<SyncReport> {
        self.core.run_once(TriggerOrigin::Manual).await
    }

    /// Snapshot of the sync bookkeeping
    pub fn state(&self) -> SyncState {
        self.core.orchestrator.state()
    }

    /// Whether a sync currently holds the gate
    pub fn scheduler_state(&self) -> SchedulerState {
        match self.core.gate.try_lock() {
            Ok(_) => SchedulerState::Idle,
            Err(_) => SchedulerState::Running,
        }
    }

    /// Deadline of the next automatic sync, `None` when the timer is not running
    pub fn next_tick_at(&self) -> Option<Instant> {
        *self.core.next_tick.borrow()
    }

    /// The orchestrator driven by this scheduler
    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.core.orchestrator
    }
}

impl SchedulerCore {
    async fn run_once(&self, origin: TriggerOrigin) -> Result<SyncReport> {
        let Ok(_gate) = self.gate.try_lock() else {
            info!("Rejecting {} sync trigger: a sync is already running", origin);
            self.orchestrator
                .emit_event(SyncEvent::TriggerRejected { origin });
            return Err(Error::SyncInProgress);
        };

        if self.shutdown.is_cancelled() {
            return Err(Error::cancelled("scheduler is stopped"));
        }

        let started = Instant::now();
        // Only a running timer has a deadline to move
        self.next_tick.send_if_modified(|next| match next {
            Some(deadline) => {
                *deadline = started + self.config.interval();
                true
            }
            None => false,
        });

        let mode = self.select_mode();
        debug!("{} trigger starting {} sync", origin, mode);
        self.orchestrator.run_sync(mode, &self.shutdown).await
    }

    fn select_mode(&self) -> SyncMode {
        if !self.config.incremental {
            return SyncMode::Full;
        }

        let now = Utc::now();
        match self.orchestrator.state().last_success_started_at {
            Some(since)
                if since <= now && now - since <= ChronoDuration::days(MAX_INCREMENTAL_WINDOW_DAYS) =>
            {
                SyncMode::Incremental { since, until: now }
            }
            _ => SyncMode::Full,
        }
    }
}

async fn timer_loop(core: Arc<SchedulerCore>) {
    let mut next_tick = core.next_tick.subscribe();

    loop {
        let Some(deadline) = *next_tick.borrow_and_update() else {
            break;
        };

        tokio::select! {
            _ = core.shutdown.cancelled() => break,
            changed = next_tick.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                match core.run_once(TriggerOrigin::Timer).await {
                    Ok(_) | Err(Error::SyncInProgress) | Err(Error::Cancelled(_)) => {}
                    Err(e) => error!("Scheduled sync failed: {}", e),
                }

                // A rejected tick leaves the deadline in the past
                let now = Instant::now();
                let interval = core.config.interval();
                core.next_tick.send_if_modified(|next| match next {
                    Some(d) if *d <= now => {
                        *d = now + interval;
                        true
                    }
                    _ => false,
                });
            }
        }
    }

    debug!("Scheduler timer loop exited");
}
