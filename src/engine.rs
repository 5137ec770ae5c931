//! Engine Coordinator: owns the polling loop.
//!
//! One cycle walks `Idle -> Polling -> Reconciling -> Persisting -> Notifying -> Idle`.
//! Cycles never overlap; a tick that fires while a cycle runs is skipped.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::{counter, gauge, histogram};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{IcalConfig, TrackerConfig};
use crate::error::{Result, TrackerError};
use crate::model::{RawCandidate, Transition, WatchedEntity};
use crate::notify::{ChangeKind, DispatchOutcome, Dispatcher};
use crate::provider::SearchProvider;
use crate::reconcile::Reconciler;
use crate::store::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Polling,
    Reconciling,
    Persisting,
    Notifying,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub poll_interval: Duration,
    pub max_parallel_searches: usize,
    pub search_timeout: Duration,
    pub cycle_timeout: Duration,
    pub skip_released: bool,
    pub match_threshold: f64,
    pub ical: Option<IcalConfig>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&TrackerConfig::default())
    }
}

impl EngineSettings {
    pub fn from_config(cfg: &TrackerConfig) -> Self {
        let e = &cfg.engine;
        Self {
            poll_interval: Duration::from_secs(e.poll_interval_secs),
            max_parallel_searches: e.max_parallel_searches.max(1),
            search_timeout: Duration::from_secs(e.search_timeout_secs),
            cycle_timeout: Duration::from_secs(e.cycle_timeout_secs),
            skip_released: e.skip_released,
            match_threshold: e.match_threshold,
            ical: cfg.ical.enabled.then(|| cfg.ical.clone()),
        }
    }
}

/// Summary of one completed cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub entities_polled: usize,
    pub provider_errors: usize,
    pub new: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: usize,
    pub skipped: usize,
    /// Reasons for candidates skipped as ambiguous.
    pub ambiguities: Vec<String>,
    /// Per record, per channel. Includes replays of pending receipts.
    pub notifications: BTreeMap<String, HashMap<String, DispatchOutcome>>,
    pub replayed: usize,
}

impl CycleReport {
    pub fn dispatch_count(&self) -> usize {
        self.notifications.len()
    }
}

pub struct Engine {
    store: Arc<StateStore>,
    provider: Arc<dyn SearchProvider>,
    dispatcher: Arc<Dispatcher>,
    entities: Arc<Vec<WatchedEntity>>,
    settings: EngineSettings,
    running: AtomicBool,
    state: parking_lot::Mutex<CycleState>,
}

/// Clears the running flag however the cycle ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Engine {
    pub fn new(
        store: Arc<StateStore>,
        provider: Arc<dyn SearchProvider>,
        dispatcher: Arc<Dispatcher>,
        entities: Vec<WatchedEntity>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            provider,
            dispatcher,
            entities: Arc::new(entities),
            settings,
            running: AtomicBool::new(false),
            state: parking_lot::Mutex::new(CycleState::Idle),
        }
    }

    pub fn state(&self) -> CycleState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    fn enter(&self, next: CycleState) {
        let mut s = self.state.lock();
        debug!(target: "engine", from = ?*s, to = ?next, "cycle state");
        *s = next;
    }

    /// Runs one cycle under the cycle deadline unless one is already running.
    /// `None` means the call was skipped.
    pub async fn try_cycle(&self) -> Option<Result<CycleReport>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(target: "engine", "previous cycle still running; tick skipped");
            counter!("tracker_cycles_skipped_total").increment(1);
            return None;
        }
        let _guard = RunningGuard(&self.running);

        let started = Instant::now();
        let res = match tokio::time::timeout(self.settings.cycle_timeout, self.run_cycle()).await {
            Ok(r) => r,
            Err(_) => Err(TrackerError::Cycle(format!(
                "deadline of {}s exceeded",
                self.settings.cycle_timeout.as_secs()
            ))),
        };
        self.enter(CycleState::Idle);

        let elapsed_ms = started.elapsed().as_millis() as f64;
        histogram!("tracker_cycle_duration_ms").record(elapsed_ms);
        match &res {
            Ok(r) => {
                counter!("tracker_cycles_total", "outcome" => "ok").increment(1);
                info!(
                    target: "engine",
                    entities = r.entities_polled,
                    provider_errors = r.provider_errors,
                    new = r.new.len(),
                    updated = r.updated.len(),
                    unchanged = r.unchanged,
                    skipped = r.skipped,
                    dispatched = r.dispatch_count(),
                    elapsed_ms,
                    "cycle complete"
                );
            }
            Err(e) => {
                counter!("tracker_cycles_total", "outcome" => "failed").increment(1);
                if e.is_persistence() {
                    counter!("tracker_persistence_failures_total").increment(1);
                    error!(target: "engine", elapsed_ms, "cycle failed on a store write; notifications withheld: {e}");
                } else {
                    error!(target: "engine", elapsed_ms, "cycle failed: {e}");
                }
            }
        }
        Some(res)
    }

    /// One full cycle, without the overlap guard or deadline.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        self.enter(CycleState::Polling);
        let batches = self.poll(&mut report).await;

        self.enter(CycleState::Reconciling);
        let ids: Vec<String> = batches
            .iter()
            .flat_map(|(_, c)| c.iter())
            .filter_map(|c| c.external_id.as_deref().map(str::trim))
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let existing = self.store.call(move |s| s.get_many(&ids)).await?;
        let now = Utc::now();
        let result = Reconciler::new(now)
            .skip_released(self.settings.skip_released)
            .match_threshold(self.settings.match_threshold)
            .reconcile_cycle(&batches, &existing);

        report.skipped = result.skipped;
        report.ambiguities = result.ambiguities.clone();
        report.unchanged = result.unchanged.len();
        report.new = result.new.iter().map(|t| t.current.external_id.clone()).collect();
        report.updated = result.updated.iter().map(|t| t.current.external_id.clone()).collect();
        counter!("tracker_transitions_total", "kind" => "new").increment(result.new.len() as u64);
        counter!("tracker_transitions_total", "kind" => "updated").increment(result.updated.len() as u64);
        counter!("tracker_transitions_total", "kind" => "unchanged").increment(result.unchanged.len() as u64);
        counter!("tracker_candidates_skipped_total").increment(result.skipped as u64);

        // Nothing is notified unless every write of this phase committed.
        self.enter(CycleState::Persisting);
        let channels = self.dispatcher.channel_names();
        let actionable: Vec<&Transition> = result.actionable();
        for t in &actionable {
            let mut record = t.current.clone();
            for ch in &channels {
                record.ensure_receipt(ch);
            }
            self.store.call(move |s| s.upsert(&record)).await?;
        }
        let unchanged_ids: Vec<String> = result
            .unchanged
            .iter()
            .map(|t| t.current.external_id.clone())
            .collect();
        self.store.call(move |s| s.touch_seen(&unchanged_ids, now)).await?;

        self.enter(CycleState::Notifying);
        for t in actionable {
            let id = &t.current.external_id;
            let lookup = id.clone();
            let Some(record) = self.store.call(move |s| s.get(&lookup)).await? else {
                warn!(target: "engine", id = %id, "record vanished before notify");
                continue;
            };
            let kind = match t.classification {
                crate::model::Classification::Updated => ChangeKind::Updated,
                _ => ChangeKind::New,
            };
            let outcomes = self.dispatcher.dispatch(&record, kind, &t.changed_fields).await;
            report.notifications.insert(id.clone(), outcomes);
        }

        // Receipts left pending by an earlier cycle or a crash.
        let max_attempts = self.dispatcher.backoff().max_attempts;
        let backlog = self
            .store
            .call(move |s| s.list_pending_notification(&channels, max_attempts))
            .await?;
        for record in backlog {
            if report.notifications.contains_key(&record.external_id) {
                continue;
            }
            debug!(target: "engine", id = %record.external_id, "replaying pending receipts");
            let outcomes = self.dispatcher.dispatch(&record, ChangeKind::New, &[]).await;
            report.replayed += 1;
            report.notifications.insert(record.external_id.clone(), outcomes);
        }

        let finished = Utc::now();
        self.store.call(move |s| s.set_last_successful_cycle(finished)).await?;
        gauge!("tracker_last_successful_cycle_ts").set(finished.timestamp() as f64);

        if let Some(ical) = &self.settings.ical {
            self.export_calendar(ical).await;
        }

        Ok(report)
    }

    /// Searches every entity with bounded parallelism. Failures and timeouts
    /// are logged per entity and do not affect the others.
    async fn poll(&self, report: &mut CycleReport) -> Vec<(WatchedEntity, Vec<RawCandidate>)> {
        let sem = Arc::new(Semaphore::new(self.settings.max_parallel_searches));
        let mut set = JoinSet::new();

        for entity in self.entities.iter().cloned() {
            let sem = Arc::clone(&sem);
            let provider = Arc::clone(&self.provider);
            let timeout = self.settings.search_timeout;
            set.spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                let res = match tokio::time::timeout(timeout, provider.search(&entity.query)).await {
                    Ok(r) => r,
                    Err(_) => Err(anyhow::anyhow!("search timed out after {}s", timeout.as_secs())),
                };
                (entity, res)
            });
        }

        let mut out = Vec::with_capacity(self.entities.len());
        while let Some(joined) = set.join_next().await {
            report.entities_polled += 1;
            match joined {
                Ok((entity, Ok(candidates))) => {
                    debug!(target: "engine", entity = %entity.id, candidates = candidates.len(), "entity polled");
                    out.push((entity, candidates));
                }
                Ok((entity, Err(e))) => {
                    report.provider_errors += 1;
                    let err = TrackerError::provider(&entity.id, &e);
                    warn!(target: "provider", entity = %entity.id, provider = self.provider.name(), "{err}; retrying next cycle");
                    counter!("tracker_provider_errors_total").increment(1);
                }
                Err(join_err) => {
                    report.provider_errors += 1;
                    error!(target: "engine", "search task failed: {join_err}");
                }
            }
        }
        out
    }

    async fn export_calendar(&self, ical: &IcalConfig) {
        let today = Utc::now().date_naive();
        let max_books = ical.max_books;
        let res = self
            .store
            .call(move |s| s.list_upcoming(today, Some(max_books)))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|records| crate::ical::write_calendar(&ical.path, &records, Utc::now()));
        if let Err(e) = res {
            warn!(target: "engine", path = %ical.path.display(), "calendar export failed: {e:#}");
        }
    }

    /// Starts a cycle in the background. Returns `None` when one is running.
    pub fn begin_cycle(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.is_running() {
            warn!(target: "engine", "previous cycle still running; tick skipped");
            counter!("tracker_cycles_skipped_total").increment(1);
            return None;
        }
        let engine = Arc::clone(self);
        Some(tokio::spawn(async move {
            let _ = engine.try_cycle().await;
        }))
    }

    /// Ticks every `poll_interval` until `shutdown`. An in-flight cycle is
    /// abandoned on shutdown; receipts keep their last durable state.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut inflight: Option<JoinHandle<()>> = None;

            info!(
                target: "engine",
                entities = self.entities.len(),
                every_s = self.settings.poll_interval.as_secs(),
                "engine started"
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Some(h) = self.begin_cycle() {
                            inflight = Some(h);
                        }
                    }
                }
            }

            if let Some(h) = inflight {
                h.abort();
            }
            info!(target: "engine", "engine stopped");
        })
    }
}
