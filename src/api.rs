//! Read-only HTTP query surface over the State Store.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::ical;
use crate::metrics::Metrics;
use crate::model::CatalogRecord;
use crate::store::{StateStore, StoreError};

const DEFAULT_LIMIT: usize = 100;
const CALENDAR_CONTENT_TYPE: &str = "text/calendar; charset=utf-8";

#[derive(Clone)]
pub struct AppState {
    store: Arc<StateStore>,
}

/// Builds the router. `/metrics` is merged in when `metrics` is given.
pub fn router(store: Arc<StateStore>, metrics: Option<&Metrics>) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/releases", get(list_releases))
        .route("/releases/{id}", get(get_release))
        .route("/releases/{id}/calendar.ics", get(release_calendar))
        .route("/calendar.ics", get(full_calendar))
        .with_state(AppState { store });

    let app = match metrics {
        Some(m) => api.merge(m.router()),
        None => api,
    };
    app.layer(CorsLayer::very_permissive())
}

struct ApiError(StoreError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::warn!(target: "store", "query failed: {}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": "store unavailable" })),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self(e)
    }
}

#[derive(Serialize)]
struct HealthOut {
    status: &'static str,
    records: usize,
    last_successful_cycle: Option<DateTime<Utc>>,
}

async fn health(State(state): State<AppState>) -> Response {
    let probe = state
        .store
        .call(|s| Ok((s.count()?, s.last_successful_cycle()?)))
        .await;
    match probe {
        Ok((records, last)) => Json(HealthOut {
            status: "ok",
            records,
            last_successful_cycle: last,
        })
        .into_response(),
        Err(e) => {
            tracing::warn!(target: "store", "health probe failed: {e}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthOut {
                    status: "degraded",
                    records: 0,
                    last_successful_cycle: None,
                }),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct UpcomingQuery {
    from: Option<NaiveDate>,
    limit: Option<usize>,
}

impl UpcomingQuery {
    fn from_date(&self) -> NaiveDate {
        self.from.unwrap_or_else(|| Utc::now().date_naive())
    }

    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, 1000)
    }
}

async fn list_releases(
    State(state): State<AppState>,
    Query(q): Query<UpcomingQuery>,
) -> Result<Json<Vec<CatalogRecord>>, ApiError> {
    Ok(Json(upcoming(&state, &q).await?))
}

async fn get_release(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    Ok(match lookup(&state, &id).await? {
        Some(rec) => Json(rec).into_response(),
        None => not_found(&id),
    })
}

async fn release_calendar(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    Ok(match lookup(&state, &id).await? {
        Some(rec) => calendar_response(ical::calendar_for(&rec, Utc::now())),
        None => not_found(&id),
    })
}

async fn full_calendar(
    State(state): State<AppState>,
    Query(q): Query<UpcomingQuery>,
) -> Result<Response, ApiError> {
    let rows = upcoming(&state, &q).await?;
    Ok(calendar_response(ical::calendar(&rows, Utc::now())))
}

async fn upcoming(state: &AppState, q: &UpcomingQuery) -> Result<Vec<CatalogRecord>, StoreError> {
    let (from, limit) = (q.from_date(), q.limit());
    state.store.call(move |s| s.list_upcoming(from, Some(limit))).await
}

async fn lookup(state: &AppState, id: &str) -> Result<Option<CatalogRecord>, StoreError> {
    let id = id.to_string();
    state.store.call(move |s| s.get(&id)).await
}

fn calendar_response(body: String) -> Response {
    ([(header::CONTENT_TYPE, CALENDAR_CONTENT_TYPE)], body).into_response()
}

fn not_found(id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "not found", "id": id })),
    )
        .into_response()
}
