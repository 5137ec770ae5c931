// tests/engine_cycle.rs
//
// Engine Coordinator behaviour across whole cycles: provider failures stay
// local to their entity, persistence failures fail the cycle closed, and
// receipts left pending by earlier cycles are replayed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, Utc};

use audio_release_tracker::notify::{
    BackoffPolicy, ChannelPolicy, DispatchOutcome, Dispatcher, RecordingChannel, RegisteredChannel,
};
use audio_release_tracker::provider::FixtureProvider;
use audio_release_tracker::store::{StateStore, StoreOptions};
use audio_release_tracker::{
    CatalogRecord, CycleState, Engine, EngineSettings, RawCandidate, ReceiptStatus, ReleaseDetails,
    TrackerError, WatchedEntity,
};

fn candidate(id: &str, author: &str) -> RawCandidate {
    RawCandidate {
        external_id: Some(id.into()),
        title: format!("Book {id}"),
        author: author.into(),
        narrators: vec!["Reader".into()],
        publisher: Some("Pub".into()),
        release_date: Utc::now().date_naive().checked_add_days(Days::new(20)),
        ..Default::default()
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<StateStore>,
    channel: RecordingChannel,
    engine: Engine,
}

fn harness(provider: Arc<FixtureProvider>, entities: Vec<WatchedEntity>, settings: EngineSettings) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(StateStore::open(&dir.path().join("engine.db"), StoreOptions::default()).unwrap());
    let channel = RecordingChannel::new("mem");
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        vec![RegisteredChannel::new(Arc::new(channel.clone()), ChannelPolicy::default())],
        BackoffPolicy::new(2, Duration::from_millis(1)),
    ));
    let engine = Engine::new(store.clone(), provider, dispatcher, entities, settings);
    Harness {
        _dir: dir,
        store,
        channel,
        engine,
    }
}

#[tokio::test]
async fn provider_error_only_affects_its_entity() {
    let provider = Arc::new(
        FixtureProvider::new()
            .with_error("Broken Author", "HTTP 503 from catalog")
            .with_results("Jane Author", vec![candidate("J1", "Jane Author")]),
    );
    let h = harness(
        provider,
        vec![WatchedEntity::author("Broken Author"), WatchedEntity::author("Jane Author")],
        EngineSettings::default(),
    );

    let report = h.engine.try_cycle().await.unwrap().unwrap();
    assert_eq!(report.entities_polled, 2);
    assert_eq!(report.provider_errors, 1);
    assert_eq!(report.new, vec!["J1".to_string()]);
    assert_eq!(h.channel.sent().len(), 1);
    assert!(h.store.last_successful_cycle().unwrap().is_some());
}

#[tokio::test]
async fn hanging_search_times_out_without_blocking_others() {
    let provider = Arc::new(
        FixtureProvider::new()
            .with_hang("Slow Author")
            .with_results("Jane Author", vec![candidate("J1", "Jane Author")]),
    );
    let settings = EngineSettings {
        search_timeout: Duration::from_millis(100),
        max_parallel_searches: 1,
        ..EngineSettings::default()
    };
    let h = harness(
        provider,
        vec![WatchedEntity::author("Slow Author"), WatchedEntity::author("Jane Author")],
        settings,
    );

    let report = tokio::time::timeout(Duration::from_secs(5), h.engine.try_cycle())
        .await
        .expect("cycle finished")
        .unwrap()
        .unwrap();
    assert_eq!(report.provider_errors, 1);
    assert_eq!(report.new, vec!["J1".to_string()]);
}

#[tokio::test]
async fn persistence_failure_fails_the_cycle_closed() {
    let provider = Arc::new(FixtureProvider::new().with_results("Jane Author", vec![candidate("J1", "Jane Author")]));
    let h = harness(provider, vec![WatchedEntity::author("Jane Author")], EngineSettings::default());

    // Any insert into the records table now fails, as a full disk would.
    let raw = rusqlite::Connection::open(h.store.path()).unwrap();
    raw.execute_batch(
        "CREATE TRIGGER refuse_insert BEFORE INSERT ON catalog_records
         BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
    )
    .unwrap();

    let res = h.engine.try_cycle().await.unwrap();
    match res {
        Err(e) => assert!(e.is_persistence(), "unexpected error: {e}"),
        Ok(r) => panic!("cycle should fail, got {r:?}"),
    }
    assert!(h.channel.sent().is_empty(), "nothing may be sent before state is durable");
    assert!(h.store.last_successful_cycle().unwrap().is_none());
    assert_eq!(h.engine.state(), CycleState::Idle);

    raw.execute_batch("DROP TRIGGER refuse_insert;").unwrap();
    let report = h.engine.try_cycle().await.unwrap().unwrap();
    assert_eq!(report.new, vec!["J1".to_string()]);
    assert_eq!(h.channel.sent().len(), 1);
}

#[tokio::test]
async fn pending_receipts_from_earlier_cycles_are_replayed() {
    let provider = Arc::new(FixtureProvider::new());
    let h = harness(provider, vec![WatchedEntity::author("Jane Author")], EngineSettings::default());

    let now = Utc::now();
    let mut rec = CatalogRecord {
        external_id: "P1".into(),
        details: ReleaseDetails {
            title: "Left Behind".into(),
            author: "Jane Author".into(),
            series: None,
            series_sequence: None,
            narrators: vec!["Reader".into()],
            publisher: None,
            release_date: now.date_naive() + Days::new(3),
            summary: None,
        },
        link: None,
        complete: false,
        receipts: BTreeMap::new(),
        first_seen: now,
        last_seen: now,
    };
    rec.ensure_receipt("mem");
    h.store.upsert(&rec).unwrap();

    let report = h.engine.try_cycle().await.unwrap().unwrap();
    assert_eq!(report.replayed, 1);
    assert_eq!(report.notifications["P1"]["mem"], DispatchOutcome::Delivered { attempts: 1 });
    assert_eq!(
        h.store.get("P1").unwrap().unwrap().receipt_status("mem"),
        Some(ReceiptStatus::Delivered)
    );

    let again = h.engine.try_cycle().await.unwrap().unwrap();
    assert_eq!(again.replayed, 0);
    assert_eq!(h.channel.sent().len(), 1);
}

#[tokio::test]
async fn same_release_under_two_entities_is_notified_once() {
    let shared = candidate("S1", "Jane Author, Sam Writer");
    let provider = Arc::new(
        FixtureProvider::new()
            .with_results("Jane Author", vec![shared.clone()])
            .with_results("Sam Writer", vec![shared]),
    );
    let h = harness(
        provider,
        vec![WatchedEntity::author("Jane Author"), WatchedEntity::author("Sam Writer")],
        EngineSettings::default(),
    );

    let report = h.engine.try_cycle().await.unwrap().unwrap();
    assert_eq!(report.new, vec!["S1".to_string()]);
    assert_eq!(h.channel.sent().len(), 1);
    assert_eq!(h.store.count().unwrap(), 1);
}

#[tokio::test]
async fn cycle_deadline_reports_cycle_error() {
    let provider = Arc::new(FixtureProvider::new().with_hang("Jane Author"));
    let settings = EngineSettings {
        cycle_timeout: Duration::from_millis(50),
        ..EngineSettings::default()
    };
    let h = harness(provider, vec![WatchedEntity::author("Jane Author")], settings);

    let res = h.engine.try_cycle().await.unwrap();
    assert!(matches!(res, Err(TrackerError::Cycle(_))));
    assert!(!h.engine.is_running());
}

#[tokio::test]
async fn ambiguous_candidates_are_reported_per_cycle() {
    let mut no_id = candidate("", "Jane Author");
    no_id.external_id = None;
    let provider = Arc::new(
        FixtureProvider::new().with_results("Jane Author", vec![candidate("J1", "Jane Author"), no_id]),
    );
    let h = harness(provider, vec![WatchedEntity::author("Jane Author")], EngineSettings::default());

    let report = h.engine.try_cycle().await.unwrap().unwrap();
    assert_eq!(report.new, vec!["J1".to_string()]);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.ambiguities.len(), 1);
    assert!(report.ambiguities[0].contains("has no external id"));
}
