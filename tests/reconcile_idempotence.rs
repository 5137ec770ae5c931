// tests/reconcile_idempotence.rs
//
// Reconciling the same candidates against the state they produced yields
// only `unchanged`, regardless of candidate order.

use chrono::{NaiveDate, TimeZone, Utc};

use audio_release_tracker::{CatalogRecord, Classification, RawCandidate, Reconciler, WatchedEntity};

fn cand(id: &str, title: &str, day: u32) -> RawCandidate {
    RawCandidate {
        external_id: Some(id.into()),
        title: title.into(),
        author: "Jane Author".into(),
        series: Some("Saga".into()),
        series_sequence: Some(day.to_string()),
        narrators: vec!["Jane".into()],
        publisher: Some("Pub".into()),
        release_date: NaiveDate::from_ymd_opt(2025, 3, day),
        ..Default::default()
    }
}

fn reconciler() -> Reconciler {
    Reconciler::new(Utc.with_ymd_and_hms(2025, 2, 1, 9, 0, 0).unwrap())
}

fn apply(result: &audio_release_tracker::ReconciliationResult) -> Vec<CatalogRecord> {
    result
        .new
        .iter()
        .chain(&result.updated)
        .chain(&result.unchanged)
        .map(|t| t.current.clone())
        .collect()
}

#[test]
fn second_pass_is_all_unchanged() {
    let entity = WatchedEntity::author("Jane Author");
    let candidates = vec![cand("A1", "Book One", 3), cand("A2", "Book Two", 10), cand("A3", "Book Three", 20)];

    let first = reconciler().reconcile(&entity, &candidates, &[]);
    assert_eq!(first.new.len(), 3);
    let state = apply(&first);

    let second = reconciler().reconcile(&entity, &candidates, &state);
    assert!(second.new.is_empty());
    assert!(second.updated.is_empty());
    assert_eq!(second.unchanged.len(), 3);
    assert!(second
        .unchanged
        .iter()
        .all(|t| t.classification == Classification::Unchanged && t.changed_fields.is_empty()));
}

#[test]
fn candidate_order_does_not_matter() {
    let entity = WatchedEntity::author("Jane Author");
    let forward = vec![cand("A1", "Book One", 3), cand("A2", "Book Two", 10), cand("A3", "Book Three", 20)];
    let mut backward = forward.clone();
    backward.reverse();

    let a = reconciler().reconcile(&entity, &forward, &[]);
    let b = reconciler().reconcile(&entity, &backward, &[]);
    let ids = |r: &audio_release_tracker::ReconciliationResult| {
        r.new.iter().map(|t| t.current.external_id.clone()).collect::<Vec<_>>()
    };
    assert_eq!(ids(&a), ids(&b));
    assert_eq!(ids(&a), vec!["A1", "A2", "A3"]);
}

#[test]
fn whitespace_noise_is_not_a_change() {
    let entity = WatchedEntity::author("Jane Author");
    let first = reconciler().reconcile(&entity, &[cand("A1", "Book One", 3)], &[]);
    let state = apply(&first);

    let mut noisy = cand("A1", "  Book   One ", 3);
    noisy.narrators = vec![" Jane ".into()];
    let second = reconciler().reconcile(&entity, &[noisy], &state);
    assert_eq!(second.unchanged.len(), 1, "{second:?}");
}

#[test]
fn ambiguous_candidates_are_skipped_not_guessed() {
    let entity = WatchedEntity::author("Jane Author");
    let mut no_id = cand("", "Mystery", 3);
    no_id.external_id = None;
    let mut no_date = cand("A9", "Undated", 3);
    no_date.release_date = None;
    let candidates = vec![cand("A1", "Book One", 3), cand("A1", "Book One (dup)", 4), no_id, no_date];

    let res = reconciler().reconcile(&entity, &candidates, &[]);
    assert_eq!(res.new.len(), 1);
    assert_eq!(res.new[0].current.details.title, "Book One");
    assert_eq!(res.skipped, 3);

    assert_eq!(res.ambiguities.len(), 3);
    assert!(res
        .ambiguities
        .iter()
        .all(|a| a.starts_with("reconciliation ambiguity: author:jane author: ")));
    assert!(res.ambiguities.iter().any(|a| a.contains("A1 appears twice")));
    assert!(res.ambiguities.iter().any(|a| a.contains("'Mystery' has no external id")));
    assert!(res.ambiguities.iter().any(|a| a.contains("A9 has no usable release date")));
}

#[test]
fn records_missing_from_results_are_untouched() {
    let entity = WatchedEntity::author("Jane Author");
    let first = reconciler().reconcile(&entity, &[cand("A1", "Book One", 3), cand("A2", "Book Two", 10)], &[]);
    let state = apply(&first);

    let res = reconciler().reconcile(&entity, &[cand("A1", "Book One", 3)], &state);
    assert_eq!(res.unchanged.len(), 1);
    assert!(res.new.is_empty() && res.updated.is_empty());
}
