//! Audiobook release tracker: binary entrypoint.
//! Wires config, store, provider, channels, the polling engine, retention
//! and the read-only HTTP surface, then runs until Ctrl-C.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use audio_release_tracker::config::{load_watchlist_default, TrackerConfig};
use audio_release_tracker::metrics::Metrics;
use audio_release_tracker::notify::{channels_from_config, BackoffPolicy, Dispatcher};
use audio_release_tracker::provider::AudibleProvider;
use audio_release_tracker::store::{StateStore, StoreOptions};
use audio_release_tracker::{api, telemetry, Engine, EngineSettings, RetentionScheduler};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when the file is absent.
    let _ = dotenvy::dotenv();

    let cfg = TrackerConfig::load_default()?;
    telemetry::init_tracing(&cfg.logging)?;

    let metrics = if cfg.api.metrics {
        Some(Metrics::install()?)
    } else {
        None
    };

    let entities = load_watchlist_default()?;
    if entities.is_empty() {
        warn!(target: "engine", "watchlist is empty; cycles will find nothing");
    }

    let store = Arc::new(
        StateStore::open(
            &cfg.store.path,
            StoreOptions {
                pool_size: cfg.store.pool_size,
                ..StoreOptions::default()
            },
        )
        .with_context(|| format!("opening state store at {}", cfg.store.path.display()))?,
    );

    let channels = channels_from_config(&cfg.notify);
    if channels.is_empty() {
        warn!(target: "notify", "no notification channel enabled");
    }
    let backoff = BackoffPolicy::new(cfg.notify.max_attempts, cfg.notify.backoff_base())
        .with_max(cfg.notify.backoff_max());
    let dispatcher = Arc::new(
        Dispatcher::new(Arc::clone(&store), channels, backoff)
            .with_send_timeout(std::time::Duration::from_secs(cfg.notify.send_timeout_secs)),
    );

    let provider = Arc::new(AudibleProvider::new(cfg.provider.clone())?);
    let engine = Arc::new(Engine::new(
        Arc::clone(&store),
        provider,
        Arc::clone(&dispatcher),
        entities,
        EngineSettings::from_config(&cfg),
    ));

    let shutdown = CancellationToken::new();
    let retention = RetentionScheduler::new(Arc::clone(&store), &cfg.retention, dispatcher.receipt_guard())
        .spawn(shutdown.clone());
    let engine_task = engine.spawn(shutdown.clone());

    let server = if cfg.api.enabled {
        let listener = tokio::net::TcpListener::bind(&cfg.api.bind)
            .await
            .with_context(|| format!("binding {}", cfg.api.bind))?;
        info!(target: "engine", bind = %cfg.api.bind, "query api listening");
        let app = api::router(Arc::clone(&store), metrics.as_ref());
        let token = shutdown.clone();
        Some(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!(target: "engine", "shutdown requested");
    shutdown.cancel();

    let _ = engine_task.await;
    let _ = retention.await;
    if let Some(server) = server {
        match server.await {
            Ok(Err(e)) => warn!(target: "engine", "http server error: {e}"),
            Err(e) => warn!(target: "engine", "http server task failed: {e}"),
            Ok(Ok(())) => {}
        }
    }
    Ok(())
}
