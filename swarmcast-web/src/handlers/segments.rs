//! Segment file delivery with range support.

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderValue, header};
use axum::response::{IntoResponse, Response};
use swarmcast_core::JobId;
use tower::ServiceExt;
use tower_http::services::ServeFile;

use super::ApiError;
use crate::server::AppState;

pub async fn get_segment(
    State(state): State<AppState>,
    Path((id, rendition, file)): Path<(JobId, String, String)>,
    request: Request,
) -> Result<Response, ApiError> {
    let path = state.service.segment_path(id, &rendition, &file).await?;

    let response = match ServeFile::new(path).oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    };
    let mut response = response.map(Body::new);
    if response.status().is_success() {
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("video/MP2T"));
    }
    Ok(response.into_response())
}
