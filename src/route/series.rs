use axum::extract::{Query, State};
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::AppError;
use crate::model::{BroadcastEvent, Series};
use crate::result::Result;
use crate::route::AppState;

pub fn route() -> Router<AppState> {
    Router::new()
        .route("/series", get(list_series))
        .route("/series/resolve", get(resolve_series))
        .route("/events", get(list_events))
}

async fn list_series(State(state): State<AppState>) -> Result<Json<Vec<Series>>> {
    let series = state.upstream.list_series().await?;
    Ok(Json(series.as_ref().clone()))
}

#[derive(Deserialize)]
struct ResolveQuery {
    series_url: Option<String>,
}

async fn resolve_series(
    State(state): State<AppState>,
    Query(query): Query<ResolveQuery>,
) -> Result<Json<Value>> {
    let url = non_empty(query.series_url)
        .ok_or_else(|| AppError::bad_request_field("series_url is required", "series_url"))?;
    match state.upstream.resolve_series_code(&url).await {
        Some(code) => Ok(Json(json!({ "seriesCode": code }))),
        None => Err(AppError::not_found(format!("no series code in '{url}'"))),
    }
}

#[derive(Deserialize)]
struct EventsQuery {
    series_code: Option<String>,
    series_url: Option<String>,
    series_id: Option<String>,
}

async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<BroadcastEvent>>> {
    let mut key = non_empty(query.series_code);
    if key.is_none() {
        if let Some(url) = non_empty(query.series_url) {
            key = state.upstream.resolve_series_code(&url).await;
        }
    }
    if key.is_none() {
        key = non_empty(query.series_id);
    }
    let key = key.ok_or_else(|| {
        AppError::bad_request("one of series_code, series_url or series_id is required")
    })?;
    Ok(Json(state.upstream.fetch_events(&key).await?))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
