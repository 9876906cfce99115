use axum::response::{IntoResponse, Json, Response};
use http::StatusCode;
use serde_json::json;

use crate::capture::CaptureError;
use crate::store::StoreError;
use crate::upstream::UpstreamError;

#[derive(Debug)]
pub enum AppError {
    BadRequest {
        message: String,
        field: Option<String>,
    },
    NotFound(String),
    Conflict(String),
    UpstreamUnavailable(String),
    UpstreamMalformed(String),
    CaptureFailed(String),
    StorageIO(String),
    Canceled(String),
    InternalServerError(anyhow::Error),
}

impl AppError {
    pub fn bad_request<T>(t: T) -> Self
    where
        T: ToString,
    {
        AppError::BadRequest {
            message: t.to_string(),
            field: None,
        }
    }

    pub fn bad_request_field<T>(t: T, field: &str) -> Self
    where
        T: ToString,
    {
        AppError::BadRequest {
            message: t.to_string(),
            field: Some(field.to_string()),
        }
    }

    pub fn not_found<T>(t: T) -> Self
    where
        T: ToString,
    {
        AppError::NotFound(t.to_string())
    }

    pub fn conflict<T>(t: T) -> Self
    where
        T: ToString,
    {
        AppError::Conflict(t.to_string())
    }

    fn kind(&self) -> &'static str {
        match self {
            AppError::BadRequest { .. } => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::UpstreamUnavailable(_) => "upstream_unavailable",
            AppError::UpstreamMalformed(_) => "upstream_malformed",
            AppError::CaptureFailed(_) => "capture_failed",
            AppError::StorageIO(_) => "storage_io",
            AppError::Canceled(_) => "canceled",
            AppError::InternalServerError(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::UpstreamUnavailable(_) | AppError::UpstreamMalformed(_) => {
                StatusCode::BAD_GATEWAY
            }
            AppError::CaptureFailed(_) | AppError::StorageIO(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            // Client-closed-request; never produced by handlers that answer
            // normal queries, but kept for completeness of the kind map.
            AppError::Canceled(_) => StatusCode::from_u16(499).unwrap(),
            AppError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            AppError::BadRequest { message, .. } => message.clone(),
            AppError::NotFound(m)
            | AppError::Conflict(m)
            | AppError::UpstreamUnavailable(m)
            | AppError::UpstreamMalformed(m)
            | AppError::CaptureFailed(m)
            | AppError::StorageIO(m)
            | AppError::Canceled(m) => m.clone(),
            AppError::InternalServerError(e) => e.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut error = json!({
            "kind": self.kind(),
            "message": self.message(),
        });
        if let AppError::BadRequest {
            field: Some(field), ..
        } = &self
        {
            error["field"] = json!(field);
        }
        (status, Json(json!({ "error": error }))).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::InternalServerError(err)
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => AppError::NotFound(format!("no such entry: {id}")),
            StoreError::Conflict(id) => AppError::Conflict(format!("id already exists: {id}")),
            StoreError::Io(e) => AppError::StorageIO(e.to_string()),
            StoreError::Encode(e) => AppError::StorageIO(e.to_string()),
        }
    }
}

impl From<UpstreamError> for AppError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::Unavailable(m) => AppError::UpstreamUnavailable(m),
            UpstreamError::Malformed(m) => AppError::UpstreamMalformed(m),
        }
    }
}

impl From<CaptureError> for AppError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::Canceled => AppError::Canceled("capture canceled".to_string()),
            other => AppError::CaptureFailed(other.to_string()),
        }
    }
}
