// tests/scenario_updated_narrator.rs
//
// A narrator added after first delivery is an update. Only channels that
// opted into update notifications hear about it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, Utc};

use audio_release_tracker::notify::{
    BackoffPolicy, ChangeKind, ChannelPolicy, DispatchOutcome, Dispatcher, RecordingChannel,
    RegisteredChannel, SkipReason,
};
use audio_release_tracker::provider::FixtureProvider;
use audio_release_tracker::store::{StateStore, StoreOptions};
use audio_release_tracker::{Engine, EngineSettings, RawCandidate, Reconciler, WatchedEntity};

fn candidate(narrators: &[&str]) -> RawCandidate {
    RawCandidate {
        external_id: Some("X1".into()),
        title: "Book A".into(),
        author: "Jane Author".into(),
        narrators: narrators.iter().map(|n| n.to_string()).collect(),
        publisher: Some("Pub".into()),
        release_date: Utc::now().date_naive().checked_add_days(Days::new(30)),
        ..Default::default()
    }
}

#[test]
fn reconciler_reports_only_the_narrator_field() {
    let entity = WatchedEntity::author("Jane Author");
    let r = Reconciler::new(Utc::now());
    let first = r.reconcile(&entity, &[candidate(&["Jane"])], &[]);
    let existing = vec![first.new[0].current.clone()];

    let second = r.reconcile(&entity, &[candidate(&["Jane", "John"])], &existing);
    assert_eq!(second.updated.len(), 1);
    assert_eq!(second.updated[0].changed_fields, vec!["narrator".to_string()]);
    assert_eq!(second.updated[0].previous.as_ref().unwrap().details.narrators, vec!["Jane"]);
}

#[tokio::test]
async fn update_is_resent_only_where_enabled() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(StateStore::open(&dir.path().join("b.db"), StoreOptions::default()).unwrap());

    let eager = RecordingChannel::new("eager");
    let quiet = RecordingChannel::new("quiet");
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        vec![
            RegisteredChannel::new(
                Arc::new(eager.clone()),
                ChannelPolicy {
                    notify_on_update: true,
                    required: false,
                },
            ),
            RegisteredChannel::new(Arc::new(quiet.clone()), ChannelPolicy::default()),
        ],
        BackoffPolicy::new(3, Duration::from_millis(1)),
    ));

    let provider = Arc::new(FixtureProvider::new().with_results("Jane Author", vec![candidate(&["Jane"])]));
    let engine = Engine::new(
        store.clone(),
        provider.clone(),
        dispatcher,
        vec![WatchedEntity::author("Jane Author")],
        EngineSettings::default(),
    );

    engine.try_cycle().await.unwrap().unwrap();
    assert_eq!(eager.sent().len(), 1);
    assert_eq!(quiet.sent().len(), 1);

    provider.set_results("Jane Author", vec![candidate(&["Jane", "John"])]);
    let report = engine.try_cycle().await.unwrap().unwrap();
    assert_eq!(report.updated, vec!["X1".to_string()]);

    let outcomes = &report.notifications["X1"];
    assert_eq!(outcomes["eager"], DispatchOutcome::Delivered { attempts: 1 });
    assert_eq!(outcomes["quiet"], DispatchOutcome::Skipped(SkipReason::UpdateSuppressed));

    let sent = eager.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].change_kind, ChangeKind::Updated);
    assert_eq!(sent[1].narrators, vec!["Jane", "John"]);
    assert_eq!(sent[1].change_summary.as_deref(), Some("Changed: narrator"));
    assert_eq!(quiet.sent().len(), 1);

    let rec = store.get("X1").unwrap().unwrap();
    assert_eq!(rec.details.narrators, vec!["Jane", "John"]);
}
