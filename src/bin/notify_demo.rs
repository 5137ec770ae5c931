//! Sends one sample release through the configured channels (or an
//! in-memory channel when none is enabled) using a throwaway store.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Days, Utc};

use audio_release_tracker::config::TrackerConfig;
use audio_release_tracker::model::{CatalogRecord, ReleaseDetails};
use audio_release_tracker::notify::{
    channels_from_config, BackoffPolicy, ChangeKind, ChannelPolicy, Dispatcher, RecordingChannel,
    RegisteredChannel,
};
use audio_release_tracker::store::{StateStore, StoreOptions};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt().with_target(false).init();

    let cfg = TrackerConfig::load_default()?;
    let mut channels = channels_from_config(&cfg.notify);
    let recorder = RecordingChannel::new("memory");
    if channels.is_empty() {
        println!("no channel enabled; using the in-memory channel");
        channels.push(RegisteredChannel::new(Arc::new(recorder.clone()), ChannelPolicy::default()));
    }

    let dir = std::env::temp_dir().join(format!("notify-demo-{}", std::process::id()));
    let store = Arc::new(StateStore::open(&dir.join("demo.db"), StoreOptions::default())?);

    let now = Utc::now();
    let release = now.date_naive().checked_add_days(Days::new(14)).unwrap_or(now.date_naive());
    let mut record = CatalogRecord {
        external_id: "B0DEMO0001".into(),
        details: ReleaseDetails {
            title: "The Demo Chronicle".into(),
            author: "Jane Author".into(),
            series: Some("Demo Saga".into()),
            series_sequence: Some("3".into()),
            narrators: vec!["Sam Reader".into()],
            publisher: Some("Demo Audio".into()),
            release_date: release,
            summary: Some("A sample release used to check channel wiring.".into()),
        },
        link: Some("https://www.audible.com/pd/B0DEMO0001".into()),
        complete: true,
        receipts: Default::default(),
        first_seen: now,
        last_seen: now,
    };
    for ch in &channels {
        record.ensure_receipt(ch.name());
    }
    store.upsert(&record)?;

    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        channels,
        BackoffPolicy::new(cfg.notify.max_attempts, cfg.notify.backoff_base()).with_max(cfg.notify.backoff_max()),
    );
    let outcomes = dispatcher.dispatch(&record, ChangeKind::New, &[]).await;
    for (channel, outcome) in &outcomes {
        println!("{channel}: {outcome:?}");
    }
    for payload in recorder.sent() {
        println!("--- memory channel ---\n{}\n{}", payload.headline(), payload.text_body());
    }

    let _ = std::fs::remove_dir_all(&dir);
    println!("notify-demo done");
    Ok(())
}
