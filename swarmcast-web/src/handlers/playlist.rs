//! Master/media manifest and readiness probe.

use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use swarmcast_core::{JobId, PlaylistProbe};

use super::ApiError;
use crate::server::AppState;

const MPEGURL: &str = "application/vnd.apple.mpegurl";

#[derive(Debug, Deserialize)]
pub struct PlaylistQuery {
    /// Rendition name; absent selects the master manifest
    pub res: Option<String>,
}

pub async fn get_playlist(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
    Query(query): Query<PlaylistQuery>,
) -> Result<Response, ApiError> {
    let manifest = match query.res.as_deref() {
        Some(rendition) => state.service.media_manifest(id, rendition).await?,
        None => state.service.master_manifest(id).await?,
    };

    Ok((
        [
            (header::CONTENT_TYPE, MPEGURL),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        manifest,
    )
        .into_response())
}

/// 200 once any rendition has output, 410 for a failed job, 404 otherwise.
pub async fn head_playlist(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> Result<StatusCode, ApiError> {
    Ok(match state.service.playlist_probe(id).await? {
        PlaylistProbe::Ready => StatusCode::OK,
        PlaylistProbe::Gone => StatusCode::GONE,
        PlaylistProbe::NotReady => StatusCode::NOT_FOUND,
    })
}
