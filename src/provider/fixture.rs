// src/provider/fixture.rs
use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::SearchProvider;
use crate::model::{EntityQuery, RawCandidate};

#[derive(Debug, Clone)]
enum Canned {
    Hits(Vec<RawCandidate>),
    Fail(String),
    Hang,
}

/// Canned results keyed by query term. Unknown terms return no hits.
#[derive(Debug, Default)]
pub struct FixtureProvider {
    canned: RwLock<HashMap<String, Canned>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl FixtureProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every search sleeps this long first.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_results(self, term: &str, hits: Vec<RawCandidate>) -> Self {
        self.set_results(term, hits);
        self
    }

    pub fn with_error(self, term: &str, message: &str) -> Self {
        self.canned
            .write()
            .insert(term.to_string(), Canned::Fail(message.to_string()));
        self
    }

    /// Searches for `term` never return.
    pub fn with_hang(self, term: &str) -> Self {
        self.canned.write().insert(term.to_string(), Canned::Hang);
        self
    }

    /// Replace the hits for `term` between cycles.
    pub fn set_results(&self, term: &str, hits: Vec<RawCandidate>) {
        self.canned.write().insert(term.to_string(), Canned::Hits(hits));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl SearchProvider for FixtureProvider {
    async fn search(&self, query: &EntityQuery) -> Result<Vec<RawCandidate>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let canned = self.canned.read().get(&query.term).cloned();
        match canned {
            None => Ok(Vec::new()),
            Some(Canned::Hits(h)) => Ok(h),
            Some(Canned::Fail(m)) => Err(anyhow!(m)),
            Some(Canned::Hang) => {
                std::future::pending::<()>().await;
                Ok(Vec::new())
            }
        }
    }

    fn name(&self) -> &'static str {
        "fixture"
    }
}
