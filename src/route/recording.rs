use std::collections::BTreeMap;
use std::path::PathBuf;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, patch, post};
use axum::Router;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::capture::muxer::{PLAYLIST_NAME, SEGMENTS_DIR};
use crate::convert;
use crate::error::AppError;
use crate::model::Recording;
use crate::result::Result;
use crate::route::AppState;

pub fn route() -> Router<AppState> {
    Router::new()
        .route("/recordings", get(list_recordings))
        .route("/recordings/bulk-download", post(bulk_download))
        .route("/recordings/{id}", delete(delete_recording))
        .route("/recordings/{id}/metadata", patch(patch_metadata))
        .route("/recordings/{id}/download", get(download))
        .route("/recordings/{id}/recording.m3u8", get(playlist))
        .route("/recordings/{id}/segments/{segment}", get(segment))
}

async fn list_recordings(State(state): State<AppState>) -> Result<Json<Vec<Recording>>> {
    Ok(Json(state.store.list_recordings().await))
}

async fn patch_metadata(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(patch): Json<BTreeMap<String, Value>>,
) -> Result<Json<Recording>> {
    let patch: BTreeMap<String, String> = patch
        .into_iter()
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (k, v)
        })
        .collect();
    let updated = state.store.update_recording_metadata(id, patch).await?;
    Ok(Json(updated))
}

async fn delete_recording(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    state.store.delete_recording(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn download(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Response> {
    let recording = require_recording(&state, id).await?;
    let dir = state.store.recording_dir(recording.id);
    let container = convert::hls_to_container(
        &state.config.recorder.muxer_program,
        &dir,
        &recording.metadata,
    )
    .await
    .map_err(AppError::InternalServerError)?;

    stream_file(
        container,
        "audio/mp4",
        Some(format!("attachment; filename=\"{id}.m4a\"")),
    )
    .await
}

#[derive(Deserialize)]
struct BulkDownloadRequest {
    ids: Vec<Uuid>,
}

/// Stream a ZIP of converted containers, stored uncompressed, one entry per
/// requested recording in request order. Unknown ids are skipped.
async fn bulk_download(
    State(state): State<AppState>,
    Json(req): Json<BulkDownloadRequest>,
) -> Result<Response> {
    let mut entries = Vec::new();
    for id in req.ids {
        let Some(recording) = state.store.get_recording(id).await else {
            continue;
        };
        let dir = state.store.recording_dir(recording.id);
        let container = convert::hls_to_container(
            &state.config.recorder.muxer_program,
            &dir,
            &recording.metadata,
        )
        .await
        .map_err(AppError::InternalServerError)?;
        entries.push((format!("{id}.m4a"), container));
    }

    let archive = convert::bundle_zip(entries)
        .await
        .map_err(AppError::InternalServerError)?;
    let body = Body::from_stream(ReaderStream::new(archive));
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"recordings.zip\"".to_string(),
            ),
        ],
        body,
    )
        .into_response())
}

async fn playlist(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Response> {
    let recording = require_recording(&state, id).await?;
    let path = state.store.recording_dir(recording.id).join(PLAYLIST_NAME);
    stream_file(path, "application/vnd.apple.mpegurl", None).await
}

async fn segment(
    State(state): State<AppState>,
    Path((id, segment)): Path<(Uuid, String)>,
) -> Result<Response> {
    if segment.contains("..") || segment.contains('/') {
        return Err(AppError::bad_request("invalid segment name"));
    }
    let recording = require_recording(&state, id).await?;
    let path = state
        .store
        .recording_dir(recording.id)
        .join(SEGMENTS_DIR)
        .join(&segment);
    stream_file(path, "video/mp2t", None).await
}

async fn require_recording(state: &AppState, id: Uuid) -> Result<Recording> {
    state
        .store
        .get_recording(id)
        .await
        .ok_or_else(|| AppError::not_found(format!("no recording {id}")))
}

async fn stream_file(
    path: PathBuf,
    content_type: &'static str,
    disposition: Option<String>,
) -> Result<Response> {
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| AppError::not_found(format!("missing file {:?}", path.file_name())))?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut headers = vec![(header::CONTENT_TYPE, content_type.to_string())];
    if let Some(disposition) = disposition {
        headers.push((header::CONTENT_DISPOSITION, disposition));
    }
    Ok((headers_into(headers), body).into_response())
}

fn headers_into(pairs: Vec<(header::HeaderName, String)>) -> header::HeaderMap {
    let mut map = header::HeaderMap::new();
    for (name, value) in pairs {
        if let Ok(value) = value.parse() {
            map.insert(name, value);
        }
    }
    map
}
