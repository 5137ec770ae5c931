//! Retention Scheduler: date-driven deletion plus periodic compaction.
//!
//! Runs on its own timers, independent of polling cycles. Failures are logged
//! and retried on the next tick; nothing here is fatal to the process.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use metrics::{counter, gauge};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RetentionConfig;
use crate::store::{ReceiptGuard, StateStore};

pub struct RetentionScheduler {
    store: Arc<StateStore>,
    guard: ReceiptGuard,
    grace_period_days: u32,
    cleanup_interval: Duration,
    vacuum_interval: chrono::Duration,
    vacuum_check_interval: Duration,
}

impl RetentionScheduler {
    pub fn new(store: Arc<StateStore>, cfg: &RetentionConfig, guard: ReceiptGuard) -> Self {
        Self {
            store,
            guard,
            grace_period_days: cfg.cleanup_grace_period_days,
            cleanup_interval: Duration::from_secs(cfg.cleanup_interval_secs.max(1)),
            vacuum_interval: chrono::Duration::days(i64::from(cfg.vacuum_interval_days.max(1))),
            vacuum_check_interval: Duration::from_secs(cfg.vacuum_check_interval_secs.max(1)),
        }
    }

    /// One deletion pass. Returns the number of deleted records, 0 on failure.
    pub fn run_cleanup(&self, today: NaiveDate) -> usize {
        match self
            .store
            .delete_expired(today, self.grace_period_days, &self.guard)
        {
            Ok(n) => {
                counter!("tracker_records_deleted_total").increment(n as u64);
                if n > 0 {
                    info!(target: "retention", deleted = n, %today, grace_days = self.grace_period_days, "cleanup pass");
                } else {
                    debug!(target: "retention", %today, "cleanup pass: nothing expired");
                }
                n
            }
            Err(e) => {
                warn!(target: "retention", "cleanup pass failed, retrying next tick: {e}");
                counter!("tracker_retention_failures_total", "op" => "cleanup").increment(1);
                0
            }
        }
    }

    /// Vacuums when the last successful vacuum is older than the interval
    /// (or never happened). Returns whether a vacuum ran.
    pub fn maybe_vacuum(&self, now: DateTime<Utc>) -> bool {
        let last = match self.store.last_vacuum() {
            Ok(last) => last,
            Err(e) => {
                warn!(target: "retention", "reading last vacuum time failed: {e}");
                return false;
            }
        };
        if let Some(last) = last {
            if now - last < self.vacuum_interval {
                return false;
            }
        }

        match self.store.vacuum().and_then(|_| self.store.set_last_vacuum(now)) {
            Ok(()) => {
                gauge!("tracker_last_vacuum_ts").set(now.timestamp() as f64);
                true
            }
            Err(e) => {
                warn!(target: "retention", "vacuum failed, retrying next check: {e}");
                counter!("tracker_retention_failures_total", "op" => "vacuum").increment(1);
                false
            }
        }
    }

    /// Spawns the cleanup and vacuum timers until `shutdown` fires. Each pass
    /// runs on the blocking pool.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        let this = Arc::new(self);
        tokio::spawn(async move {
            let mut cleanup = tokio::time::interval(this.cleanup_interval);
            cleanup.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut vacuum = tokio::time::interval(this.vacuum_check_interval);
            vacuum.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(
                target: "retention",
                cleanup_every_s = this.cleanup_interval.as_secs(),
                vacuum_every_days = this.vacuum_interval.num_days(),
                "retention scheduler started"
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = cleanup.tick() => {
                        let s = Arc::clone(&this);
                        if let Err(e) = tokio::task::spawn_blocking(move || s.run_cleanup(Utc::now().date_naive())).await {
                            warn!(target: "retention", "cleanup task failed: {e}");
                        }
                    }
                    _ = vacuum.tick() => {
                        let s = Arc::clone(&this);
                        if let Err(e) = tokio::task::spawn_blocking(move || s.maybe_vacuum(Utc::now())).await {
                            warn!(target: "retention", "vacuum task failed: {e}");
                        }
                    }
                }
            }
            info!(target: "retention", "retention scheduler stopped");
        })
    }
}
