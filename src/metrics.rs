use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

#[derive(Clone)]
pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder. Call once per process.
    pub fn install() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;
        describe();
        Ok(Self { handle })
    }

    /// A recorder that is not installed globally; for tests and tools.
    pub fn detached() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        Self {
            handle: recorder.handle(),
        }
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}

/// One-time metrics registration (so series show up on /metrics).
pub fn describe() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("tracker_cycles_total", "Polling cycles by outcome.");
        describe_counter!("tracker_cycles_skipped_total", "Ticks skipped because a cycle was still running.");
        describe_counter!("tracker_persistence_failures_total", "Cycles aborted by a store write failure.");
        describe_histogram!("tracker_cycle_duration_ms", "Wall time of one polling cycle.");
        describe_gauge!("tracker_last_successful_cycle_ts", "Unix ts of the last successful cycle.");
        describe_counter!("tracker_provider_errors_total", "Search failures per entity.");
        describe_counter!("tracker_transitions_total", "Reconciled records by classification.");
        describe_counter!("tracker_candidates_skipped_total", "Candidates dropped as ambiguous or irrelevant.");
        describe_counter!("tracker_notifications_total", "Dispatch outcomes per channel.");
        describe_counter!(
            "tracker_notifications_failed_permanently_total",
            "Receipts that reached failed_permanently."
        );
        describe_counter!("tracker_records_deleted_total", "Records removed by retention.");
        describe_counter!("tracker_retention_failures_total", "Failed cleanup or vacuum runs.");
        describe_gauge!("tracker_last_vacuum_ts", "Unix ts of the last vacuum.");
    });
}
