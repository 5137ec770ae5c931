// src/provider/mod.rs
//! Catalog search providers. The engine only sees [`SearchProvider`].

pub mod audible;
pub mod cache;
pub mod fixture;

use anyhow::Result;

use crate::model::{EntityQuery, RawCandidate};

pub use audible::AudibleProvider;
pub use cache::SearchCache;
pub use fixture::FixtureProvider;

#[async_trait::async_trait]
pub trait SearchProvider: Send + Sync {
    /// Candidate releases for one query. Errors are retried next cycle.
    async fn search(&self, query: &EntityQuery) -> Result<Vec<RawCandidate>>;
    fn name(&self) -> &'static str;
}
