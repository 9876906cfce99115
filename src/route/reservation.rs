use std::collections::BTreeSet;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{delete, get, post};
use axum::Router;
use chrono::{TimeDelta, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::model::{
    BroadcastEvent, Reservation, ReservationStatus, SeriesWatchReservation,
    SingleEventReservation,
};
use crate::result::Result;
use crate::route::AppState;

/// User-created reservations may start slightly in the past to absorb clock
/// skew between browser and appliance.
const PAST_START_GRACE_SECONDS: i64 = 10;

pub fn route() -> Router<AppState> {
    Router::new()
        .route("/reservations", get(list_reservations))
        .route("/reservations/{id}", delete(delete_reservation))
        .route("/reservation/single-event", post(create_single_event))
        .route("/reservation/watch-series", post(create_series_watch))
}

async fn list_reservations(State(state): State<AppState>) -> Result<Json<Vec<Reservation>>> {
    Ok(Json(state.store.list_reservations().await))
}

#[derive(Deserialize)]
struct SingleEventRequest {
    series_id: Option<i64>,
    series_code: Option<String>,
    event: BroadcastEvent,
}

async fn create_single_event(
    State(state): State<AppState>,
    Json(req): Json<SingleEventRequest>,
) -> Result<Json<Reservation>> {
    let event = req.event;
    if event.broadcast_event_id.trim().is_empty() {
        return Err(AppError::bad_request_field(
            "broadcast_event_id must not be empty",
            "event.broadcast_event_id",
        ));
    }
    if event.end <= event.start {
        return Err(AppError::bad_request_field(
            "event must have a positive duration",
            "event.end",
        ));
    }
    let now = Utc::now();
    if event.start < now - TimeDelta::seconds(PAST_START_GRACE_SECONDS) {
        return Err(AppError::bad_request_field(
            "event start is in the past",
            "event.start",
        ));
    }

    for existing in state.store.list_reservations().await {
        let Reservation::SingleEvent(existing) = existing else {
            continue;
        };
        if existing.event.broadcast_event_id == event.broadcast_event_id
            && !matches!(
                existing.status,
                ReservationStatus::Failed | ReservationStatus::Canceled
            )
        {
            return Err(AppError::conflict(format!(
                "broadcast event '{}' is already reserved",
                event.broadcast_event_id
            )));
        }
    }

    let reservation = Reservation::SingleEvent(SingleEventReservation {
        id: Uuid::new_v4(),
        created_at: now,
        status: ReservationStatus::Pending,
        series_id: req.series_id,
        series_code: req.series_code,
        event,
        recording_id: None,
        from_series_watch: None,
    });
    state.store.insert_reservation(reservation.clone()).await?;
    state.scheduler.wake();
    Ok(Json(reservation))
}

#[derive(Deserialize)]
struct WatchSeriesRequest {
    series_id: Option<i64>,
    series_code: Option<String>,
    area_id: Option<String>,
    #[serde(default)]
    seen_broadcast_event_ids: Vec<String>,
    series_title: Option<String>,
    series_url: Option<String>,
    series_schedule: Option<String>,
    series_thumbnail_url: Option<String>,
}

async fn create_series_watch(
    State(state): State<AppState>,
    Json(req): Json<WatchSeriesRequest>,
) -> Result<Json<Reservation>> {
    if req.series_id.is_none() && req.series_code.as_deref().unwrap_or("").trim().is_empty() {
        return Err(AppError::bad_request_field(
            "a series_id or series_code is required",
            "series_code",
        ));
    }

    let reservation = Reservation::SeriesWatch(SeriesWatchReservation {
        id: Uuid::new_v4(),
        created_at: Utc::now(),
        status: ReservationStatus::Pending,
        series_id: req.series_id,
        series_code: req
            .series_code
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty()),
        area_id: req
            .area_id
            .map(|a| a.trim().to_ascii_lowercase())
            .filter(|a| !a.is_empty()),
        seen_broadcast_event_ids: req
            .seen_broadcast_event_ids
            .into_iter()
            .collect::<BTreeSet<_>>(),
        series_title: req.series_title,
        series_url: req.series_url,
        series_schedule: req.series_schedule,
        series_thumbnail_url: req.series_thumbnail_url,
    });
    state.store.insert_reservation(reservation.clone()).await?;
    state.scheduler.wake();
    Ok(Json(reservation))
}

async fn delete_reservation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    if state.store.get_reservation(id).await.is_none() {
        return Err(AppError::not_found(format!("no reservation {id}")));
    }
    // Cancel first so an in-flight capture can never commit for a row that
    // is about to vanish.
    state.scheduler.cancel(id).await;
    state.store.delete_reservation(id).await?;
    state.scheduler.wake();
    Ok(StatusCode::NO_CONTENT)
}
