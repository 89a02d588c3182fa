//! HTTP request handlers organized by resource

pub mod jobs;
pub mod playlist;
pub mod segments;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use swarmcast_core::{ManifestError, ServiceError};
use tracing::error;

pub use jobs::{StartRequest, StatusQuery, job_status, reset_job, start_job};
pub use playlist::{PlaylistQuery, get_playlist, head_playlist};
pub use segments::get_segment;

/// Service failure rendered as an HTTP response.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ApiError::Service(err) = self;
        let status = match &err {
            ServiceError::Manifest(ManifestError::Pending) => {
                return (StatusCode::NOT_FOUND, Json(json!({ "status": "pending" })))
                    .into_response();
            }
            ServiceError::JobNotFound { .. } => StatusCode::NOT_FOUND,
            ServiceError::Manifest(ManifestError::UnknownRendition { .. }) => StatusCode::NOT_FOUND,
            ServiceError::JobActive { .. } => StatusCode::CONFLICT,
            ServiceError::InvalidRequest { .. } | ServiceError::InvalidSegmentName { .. } => {
                StatusCode::BAD_REQUEST
            }
            ServiceError::Manifest(ManifestError::Io(_))
            | ServiceError::Store(_)
            | ServiceError::Io { .. } => {
                error!(error = %err, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({ "error": err.to_string() }))).into_response()
    }
}
