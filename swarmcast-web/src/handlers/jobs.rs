//! Job lifecycle endpoints: start, status and reset.

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};
use swarmcast_core::{JobId, JobStatus, StatusReport};

use super::ApiError;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub external_id: String,
}

#[derive(Debug, Serialize)]
pub struct JobSummary {
    pub id: JobId,
    pub status: JobStatus,
    pub progress: f64,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub cleanup: Option<String>,
}

impl StatusQuery {
    fn wants_cleanup(&self) -> bool {
        matches!(self.cleanup.as_deref(), Some("1" | "true"))
    }
}

/// Creates or fetches the job and starts its pipeline if needed. Returns
/// without waiting for any download.
pub async fn start_job(
    State(state): State<AppState>,
    Json(request): Json<StartRequest>,
) -> Result<Json<JobSummary>, ApiError> {
    let outcome = state
        .service
        .start(&request.external_id, &request.source)
        .await?;
    Ok(Json(JobSummary {
        id: outcome.job.id,
        status: outcome.job.status,
        progress: outcome.job.progress,
    }))
}

pub async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusReport>, ApiError> {
    let report = state.service.status(id, query.wants_cleanup()).await?;
    Ok(Json(report))
}

pub async fn reset_job(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> Result<Json<JobSummary>, ApiError> {
    let job = state.service.reset(id).await?;
    Ok(Json(JobSummary {
        id: job.id,
        status: job.status,
        progress: job.progress,
    }))
}
