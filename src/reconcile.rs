//! Reconciler: turns raw search candidates into classified transitions.
//!
//! Pure and single-threaded. Matching is by exact external identifier only;
//! candidates that cannot be matched safely are skipped and logged, never guessed.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, warn};

use crate::error::TrackerError;
use crate::model::{
    CatalogRecord, Classification, RawCandidate, ReconciliationResult, ReleaseDetails, Transition,
    WatchedEntity,
};
use crate::normalize::{credits_contain, names_match, non_empty, normalize_text};

/// Jaro-Winkler threshold for author/series relevance checks.
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.9;

#[derive(Debug, Clone)]
pub struct Reconciler {
    now: DateTime<Utc>,
    skip_released: bool,
    match_threshold: f64,
}

impl Reconciler {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            skip_released: true,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }

    /// Do not start tracking releases that are already out on first sighting.
    pub fn skip_released(mut self, on: bool) -> Self {
        self.skip_released = on;
        self
    }

    pub fn match_threshold(mut self, threshold: f64) -> Self {
        self.match_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    fn today(&self) -> NaiveDate {
        self.now.date_naive()
    }

    /// Classifies `candidates` for one entity against `existing`.
    /// Records absent from `candidates` are never touched.
    pub fn reconcile(
        &self,
        entity: &WatchedEntity,
        candidates: &[RawCandidate],
        existing: &[CatalogRecord],
    ) -> ReconciliationResult {
        let by_id: HashMap<&str, &CatalogRecord> = existing
            .iter()
            .map(|r| (r.external_id.as_str(), r))
            .collect();

        let mut out = ReconciliationResult::default();
        let mut seen: HashSet<String> = HashSet::new();

        for cand in candidates {
            let Some(id) = cand
                .external_id
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
            else {
                out.ambiguous(entity, format!("'{}' has no external id", cand.title));
                continue;
            };

            if !seen.insert(id.to_string()) {
                out.ambiguous(entity, format!("{id} appears twice in one result set; keeping first"));
                continue;
            }

            let Some(release_date) = cand.release_date else {
                out.ambiguous(entity, format!("{id} has no usable release date"));
                continue;
            };

            if !self.is_relevant(entity, cand) {
                debug!(target: "reconcile", entity = %entity.id, id, author = %cand.author, "candidate not relevant to entity");
                out.skipped += 1;
                continue;
            }

            let details = details_from(cand, release_date);
            let complete = is_complete(entity, &details, self.match_threshold);

            match by_id.get(id) {
                None => {
                    if self.skip_released && release_date < self.today() {
                        debug!(target: "reconcile", id, %release_date, "already released on first sighting; not tracked");
                        out.skipped += 1;
                        continue;
                    }
                    let current = CatalogRecord {
                        external_id: id.to_string(),
                        details,
                        link: non_empty(cand.link.as_deref()),
                        complete,
                        receipts: Default::default(),
                        first_seen: self.now,
                        last_seen: self.now,
                    };
                    out.new.push(Transition {
                        classification: Classification::New,
                        previous: None,
                        current,
                        changed_fields: Vec::new(),
                    });
                }
                Some(prev) => {
                    let changed = prev.details.diff(&details);
                    let mut current = (*prev).clone();
                    current.last_seen = self.now;
                    if changed.is_empty() {
                        out.unchanged.push(Transition {
                            classification: Classification::Unchanged,
                            previous: Some((*prev).clone()),
                            current,
                            changed_fields: changed,
                        });
                    } else {
                        debug!(target: "reconcile", id, fields = ?changed, "release changed");
                        current.details = details;
                        current.complete = complete;
                        if let Some(link) = non_empty(cand.link.as_deref()) {
                            current.link = Some(link);
                        }
                        out.updated.push(Transition {
                            classification: Classification::Updated,
                            previous: Some((*prev).clone()),
                            current,
                            changed_fields: changed,
                        });
                    }
                }
            }
        }

        out.sort();
        out
    }

    /// Folds per-entity batches into one cycle result. When several entities
    /// surface the same identifier, the first entity (by id) classifies it.
    pub fn reconcile_cycle(
        &self,
        batches: &[(WatchedEntity, Vec<RawCandidate>)],
        existing: &[CatalogRecord],
    ) -> ReconciliationResult {
        let mut ordered: Vec<&(WatchedEntity, Vec<RawCandidate>)> = batches.iter().collect();
        ordered.sort_by(|a, b| a.0.id.cmp(&b.0.id));

        let mut claimed: HashSet<String> = HashSet::new();
        let mut total = ReconciliationResult::default();

        for (entity, candidates) in ordered {
            let part = self.reconcile(entity, candidates, existing);
            total.skipped += part.skipped;
            total.ambiguities.extend(part.ambiguities);
            for (list, into) in [
                (part.new, &mut total.new),
                (part.updated, &mut total.updated),
                (part.unchanged, &mut total.unchanged),
            ] {
                for t in list {
                    if claimed.insert(t.current.external_id.clone()) {
                        into.push(t);
                    }
                }
            }
        }

        total.sort();
        total
    }

    fn is_relevant(&self, entity: &WatchedEntity, cand: &RawCandidate) -> bool {
        if let Some(author) = entity.author_filter.as_deref() {
            if !credits_contain(&cand.author, author, self.match_threshold) {
                return false;
            }
        }
        if let Some(series) = entity.series_filter.as_deref() {
            // An empty series is kept (and marked incomplete); a different one is not.
            if let Some(found) = cand.series.as_deref().filter(|s| !s.trim().is_empty()) {
                if !names_match(found, series, self.match_threshold) {
                    return false;
                }
            }
        }
        true
    }
}

fn details_from(cand: &RawCandidate, release_date: NaiveDate) -> ReleaseDetails {
    ReleaseDetails {
        title: normalize_text(&cand.title),
        author: normalize_text(&cand.author),
        series: non_empty(cand.series.as_deref()),
        series_sequence: non_empty(cand.series_sequence.as_deref()),
        narrators: cand
            .narrators
            .iter()
            .map(|n| normalize_text(n))
            .filter(|n| !n.is_empty())
            .collect(),
        publisher: non_empty(cand.publisher.as_deref()),
        release_date,
        summary: non_empty(cand.summary.as_deref()),
    }
}

fn is_complete(entity: &WatchedEntity, d: &ReleaseDetails, threshold: f64) -> bool {
    let series_ok = match entity.series_filter.as_deref() {
        Some(wanted) => d
            .series
            .as_deref()
            .is_some_and(|s| names_match(s, wanted, threshold)),
        None => true,
    };
    !d.title.is_empty() && !d.narrators.is_empty() && d.publisher.is_some() && series_ok
}

impl ReconciliationResult {
    /// Skips a candidate that cannot be matched safely and keeps the reason.
    fn ambiguous(&mut self, entity: &WatchedEntity, detail: String) {
        let err = TrackerError::Reconciliation(format!("{}: {detail}", entity.id));
        warn!(target: "reconcile", entity = %entity.id, "{err}; candidate skipped");
        self.skipped += 1;
        self.ambiguities.push(err.to_string());
    }
}
