//! Tracker-wide error taxonomy.

use thiserror::Error;

use crate::store::StoreError;

/// Result type for engine-level operations.
pub type Result<T> = std::result::Result<T, TrackerError>;

#[derive(Error, Debug)]
pub enum TrackerError {
    /// Catalog search failed for one entity. Recovered by retrying next cycle.
    #[error("provider error for {entity}: {message}")]
    Provider { entity: String, message: String },

    /// State Store I/O failure. Aborts the persist/notify phase of a cycle.
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// A candidate could not be matched safely (missing/duplicate identifier, bad date).
    #[error("reconciliation ambiguity: {0}")]
    Reconciliation(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// A cycle was cancelled or exceeded its deadline.
    #[error("cycle aborted: {0}")]
    Cycle(String),
}

impl TrackerError {
    pub fn provider(entity: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Provider {
            entity: entity.into(),
            message: format!("{err:#}"),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Persistence errors are the only ones that fail a whole cycle closed.
    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }
}
