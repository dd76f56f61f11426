//! Polling driver: scans for eligible messages, claims them, and runs them
//! through the workflow engine on a bounded worker pool.
//!
//! Each cycle:
//! 1. Reset claims older than the stale threshold (and prune, if enabled)
//! 2. `find_eligible()` for `new` and `resume_requested` messages
//! 3. Claim each with a conditional update; a lost race is skipped
//! 4. Run claimed messages, at most `max_workers` at a time
//! 5. Persist each outcome and drop the claim
//!
//! Claims are the only exclusion mechanism, so several drivers may share one
//! database.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::DriverConfig;
use crate::store::Database;
use crate::workflow::engine::{RunOutcome, WorkflowEngine};
use crate::workflow::types::MessageStatus;

/// What happened to one claimed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposed {
    Completed,
    Suspended,
    /// Claim handed back after a conflict or storage error; retried next cycle.
    Released,
    Failed,
}

/// Counters for one cycle.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CycleReport {
    pub swept: usize,
    pub pruned: usize,
    pub eligible: usize,
    pub claimed: usize,
    pub completed: usize,
    pub suspended: usize,
    pub released: usize,
    pub failed: usize,
    pub timed_out: bool,
}

impl CycleReport {
    fn record(&mut self, disposed: Disposed) {
        match disposed {
            Disposed::Completed => self.completed += 1,
            Disposed::Suspended => self.suspended += 1,
            Disposed::Released => self.released += 1,
            Disposed::Failed => self.failed += 1,
        }
    }
}

/// Snapshot served by the status endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DriverStatus {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub cycles: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_report: Option<CycleReport>,
}

/// Runs scan/claim/dispatch cycles against a store.
pub struct Driver {
    store: Arc<dyn Database>,
    engine: Arc<WorkflowEngine>,
    config: DriverConfig,
}

impl Driver {
    pub fn new(store: Arc<dyn Database>, engine: Arc<WorkflowEngine>, config: DriverConfig) -> Self {
        Self {
            store,
            engine,
            config,
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Run a single cycle. Storage errors are logged; the cycle ends early
    /// but never panics or propagates.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();

        // Out-of-range thresholds mean nothing can be stale yet.
        let cutoff = chrono::Duration::from_std(self.config.stale_claim_after)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));
        if let Some(cutoff) = cutoff {
            match self.store.sweep_stale_claims(cutoff).await {
                Ok(n) => report.swept = n,
                Err(e) => error!("Stale claim sweep failed: {e}"),
            }
        }

        if let Some(days) = self.config.retention_days {
            match self.store.prune_terminal(days).await {
                Ok(n) => report.pruned = n,
                Err(e) => error!("Retention prune failed: {e}"),
            }
        }

        let cycle = async {
            let eligible = match self.store.find_eligible(self.config.batch_size).await {
                Ok(msgs) => msgs,
                Err(e) => {
                    error!("Failed to scan for eligible messages: {e}");
                    return;
                }
            };
            report.eligible = eligible.len();
            if eligible.is_empty() {
                return;
            }

            let mut claimed = Vec::with_capacity(eligible.len());
            for msg in &eligible {
                match self.store.claim_message(&msg.id, msg.status).await {
                    Ok(true) => claimed.push(msg.id.clone()),
                    Ok(false) => debug!(id = %msg.id, "Claim lost to another worker"),
                    Err(e) => warn!(id = %msg.id, error = %e, "Claim failed"),
                }
            }
            report.claimed = claimed.len();
            if claimed.is_empty() {
                return;
            }

            info!(
                eligible = report.eligible,
                claimed = report.claimed,
                "Dispatching claimed messages"
            );

            let mut runs = futures::stream::iter(claimed)
                .map(|id| async move { self.dispatch(&id).await })
                .buffer_unordered(self.config.max_workers.max(1));
            while let Some(disposed) = runs.next().await {
                report.record(disposed);
            }
        };

        if tokio::time::timeout(self.config.cycle_timeout, cycle)
            .await
            .is_err()
        {
            // Unfinished runs keep their claims until the stale sweep resets them.
            warn!(
                timeout_secs = self.config.cycle_timeout.as_secs(),
                "Cycle timed out with runs in flight"
            );
            report.timed_out = true;
        }

        report
    }

    /// Run one claimed message and persist how it ended.
    async fn dispatch(&self, id: &str) -> Disposed {
        match self.engine.run(id).await {
            Ok(outcome) => {
                let status = outcome.message_status();
                self.finish(id, status, None).await;
                match outcome {
                    RunOutcome::Completed(disposition) => {
                        info!(id, disposition = %disposition, "Message completed");
                        Disposed::Completed
                    }
                    RunOutcome::Suspended => {
                        info!(id, "Message awaiting human reply");
                        Disposed::Suspended
                    }
                }
            }
            Err(e) if e.is_retryable() => {
                warn!(id, error = %e, "Run aborted, releasing claim");
                match self.store.release_claim(id).await {
                    Ok(true) => {}
                    Ok(false) => warn!(id, "Claim already gone when releasing"),
                    Err(e) => error!(id, error = %e, "Failed to release claim"),
                }
                Disposed::Released
            }
            Err(e) => {
                error!(id, error = %e, "Run failed");
                self.finish(id, MessageStatus::Failed, Some(&e.to_string()))
                    .await;
                Disposed::Failed
            }
        }
    }

    async fn finish(&self, id: &str, status: MessageStatus, last_error: Option<&str>) {
        match self.store.finish_run(id, status, last_error).await {
            Ok(true) => {}
            Ok(false) => warn!(id, status = %status, "Claim no longer held, outcome not persisted"),
            Err(e) => error!(id, status = %status, error = %e, "Failed to persist run outcome"),
        }
    }
}

/// Control surface for a spawned driver loop.
#[derive(Clone)]
pub struct DriverHandle {
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
    status: Arc<RwLock<DriverStatus>>,
}

impl DriverHandle {
    /// Ask the loop to stop after the current cycle.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.wake.notify_one();
    }

    /// Start the next cycle now instead of waiting for the interval.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub async fn status(&self) -> DriverStatus {
        self.status.read().await.clone()
    }
}

/// Spawn the polling loop.
///
/// Returns a `JoinHandle` and a handle for stop, wake-up and status.
pub fn spawn_driver(driver: Arc<Driver>) -> (JoinHandle<()>, DriverHandle) {
    let handle = DriverHandle {
        shutdown: Arc::new(AtomicBool::new(false)),
        wake: Arc::new(Notify::new()),
        status: Arc::new(RwLock::new(DriverStatus::default())),
    };
    let loop_handle = handle.clone();

    let join = tokio::spawn(async move {
        let DriverHandle {
            shutdown,
            wake,
            status,
        } = loop_handle;
        let interval = driver.config().poll_interval;
        info!(
            "Driver started — polling every {}s with {} workers",
            interval.as_secs(),
            driver.config().max_workers
        );
        {
            let mut s = status.write().await;
            s.running = true;
            s.started_at = Some(Utc::now());
        }

        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = wake.notified() => debug!("Driver woken early"),
            }

            if shutdown.load(Ordering::Relaxed) {
                info!("Driver shutting down");
                break;
            }

            let report = driver.run_cycle().await;
            let mut s = status.write().await;
            s.cycles += 1;
            s.last_cycle_at = Some(Utc::now());
            s.last_report = Some(report);
        }

        status.write().await.running = false;
    });

    (join, handle)
}
