// src/lib.rs
// Public library surface for the binaries and integration tests.

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod ical;
pub mod metrics;
pub mod model;
pub mod normalize;
pub mod notify;
pub mod provider;
pub mod reconcile;
pub mod retention;
pub mod store;
pub mod telemetry;

// ---- Re-exports for stable public API ----
pub use crate::api::router;
pub use crate::config::TrackerConfig;
pub use crate::engine::{CycleReport, CycleState, Engine, EngineSettings};
pub use crate::error::{Result, TrackerError};
pub use crate::model::{
    CatalogRecord, Classification, NotificationReceipt, RawCandidate, ReceiptStatus,
    ReconciliationResult, ReleaseDetails, Transition, WatchedEntity,
};
pub use crate::notify::{
    BackoffPolicy, ChannelAdapter, ChannelError, ChannelPolicy, DispatchOutcome, Dispatcher,
    NotificationPayload, RegisteredChannel,
};
pub use crate::provider::SearchProvider;
pub use crate::reconcile::Reconciler;
pub use crate::retention::RetentionScheduler;
pub use crate::store::{ReceiptGuard, StateStore, StoreError, StoreOptions};
