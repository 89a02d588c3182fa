//! Stream service facade used by the HTTP surface.
//!
//! Owns the set of jobs that currently have a pipeline worker and answers
//! status, manifest and segment queries from job records and on-disk state.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::jobs::{Job, JobId, JobStatus, JobStoreError, JobUpdate};
use crate::manifest::{ManifestBuilder, ManifestError};
use crate::pipeline::{PipelineContext, PipelineController};
use crate::session::SessionKey;
use crate::transcode::{FsSegmentStore, SegmentStore, find_rendition, is_segment_file};

/// Errors returned to the streaming surface.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Job {id} not found")]
    JobNotFound { id: JobId },

    #[error("Job {id} has an active worker")]
    JobActive { id: JobId },

    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Invalid segment name {name}")]
    InvalidSegmentName { name: String },

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("Job store error")]
    Store(#[source] JobStoreError),

    #[error("I/O error on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<JobStoreError> for ServiceError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound { id } => ServiceError::JobNotFound { id },
            other => ServiceError::Store(other),
        }
    }
}

/// Result of a stream-start request.
#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub job: Job,
    /// A new pipeline worker was spawned for this request
    pub spawned: bool,
}

/// Swarm counters of the job's download session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SwarmSummary {
    pub seeds: u32,
    pub peers: u32,
    pub down_kbps: f64,
}

/// Per-rendition output state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VariantState {
    /// Canonical `index.m3u8` exists
    pub static_playlist: bool,
    pub segments: usize,
}

/// Status payload of one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub id: JobId,
    pub status: JobStatus,
    pub playable: bool,
    pub progress: f64,
    pub swarm: SwarmSummary,
    pub variants: BTreeMap<String, VariantState>,
    /// `"error"` or `"no-peers"`
    pub problem: Option<&'static str>,
}

/// Answer of the playlist readiness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistProbe {
    /// At least one rendition has output
    Ready,
    /// The job failed
    Gone,
    NotReady,
}

/// Removes a job from the active set when its worker ends.
struct ActiveGuard {
    active: Arc<Mutex<HashSet<JobId>>>,
    job_id: JobId,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.job_id);
    }
}

/// Entry point for stream-start, status, manifests, segments and reset.
pub struct StreamService {
    ctx: Arc<PipelineContext>,
    active: Arc<Mutex<HashSet<JobId>>>,
    manifests: ManifestBuilder,
}

impl StreamService {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        let manifests = ManifestBuilder::new(
            ctx.config.transcode.renditions.clone(),
            ctx.config.pipeline.segment_duration,
        );
        Self {
            ctx,
            active: Arc::new(Mutex::new(HashSet::new())),
            manifests,
        }
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    pub fn is_active(&self, job_id: JobId) -> bool {
        self.active.lock().contains(&job_id)
    }

    /// Base URL of a job's manifests and segments.
    pub fn base_url(&self, job_id: JobId) -> String {
        format!("{}/{}", self.ctx.config.server.api_prefix, job_id)
    }

    /// Creates or fetches the job and spawns a pipeline worker if it needs one.
    ///
    /// Returns immediately. A job with a live worker, or one that is already
    /// progressing or `READY`, is returned as is. An `ERROR` job is moved back
    /// to `PENDING` and restarted; its existing segments are reused.
    ///
    /// # Errors
    ///
    /// - `ServiceError::InvalidRequest` - Empty external id or source
    /// - `ServiceError::Store` - Job store failure
    pub async fn start(&self, external_id: &str, source: &str) -> Result<StartOutcome, ServiceError> {
        if external_id.trim().is_empty() {
            return Err(ServiceError::InvalidRequest {
                reason: "external_id is required".to_string(),
            });
        }
        if source.trim().is_empty() {
            return Err(ServiceError::InvalidRequest {
                reason: "source is required".to_string(),
            });
        }

        let mut job = self.ctx.store.get_or_create(external_id, source).await?;

        if !self.active.lock().insert(job.id) {
            return Ok(StartOutcome { job, spawned: false });
        }
        let guard = ActiveGuard {
            active: Arc::clone(&self.active),
            job_id: job.id,
        };

        match job.status {
            status if status.is_in_progress() || status == JobStatus::Ready => {
                return Ok(StartOutcome { job, spawned: false });
            }
            JobStatus::Error => {
                job = self.ctx.store.update(job.id, JobUpdate::restart()).await?;
                info!(job_id = %job.id, "Restarting failed job");
            }
            _ => {}
        }

        let job_id = job.id;
        let controller = PipelineController::new(Arc::clone(&self.ctx));
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = controller.run(job_id).await {
                error!(job_id = %job_id, error = %e, "Pipeline worker ended with error");
            }
        });
        info!(job_id = %job_id, external_id, "Pipeline worker spawned");

        Ok(StartOutcome { job, spawned: true })
    }

    /// Status report of a job. With `cleanup`, an `ERROR` job's download
    /// session is released.
    ///
    /// # Errors
    ///
    /// - `ServiceError::JobNotFound` - Unknown job id
    pub async fn status(&self, job_id: JobId, cleanup: bool) -> Result<StatusReport, ServiceError> {
        let job = self.ctx.store.get(job_id).await?;
        let segments = self.segment_store(job_id);

        let handle = self.ctx.registry.lookup_source(&job.source).await;
        let swarm = handle
            .as_ref()
            .map(|handle| {
                let diagnostics = handle.diagnostics();
                SwarmSummary {
                    seeds: diagnostics.seeds,
                    peers: diagnostics.peers,
                    down_kbps: diagnostics.down_kbps,
                }
            })
            .unwrap_or_default();

        let variants: BTreeMap<String, VariantState> = self
            .manifests
            .ladder()
            .iter()
            .map(|rendition| {
                (
                    rendition.name.clone(),
                    VariantState {
                        static_playlist: segments.has_canonical(&rendition.name),
                        segments: segments.segment_count(&rendition.name),
                    },
                )
            })
            .collect();
        let any_segments = variants.values().any(|v| v.segments > 0);

        let problem = if job.status == JobStatus::Error {
            Some("error")
        } else if handle.is_some() && swarm.seeds + swarm.peers == 0 && !any_segments {
            Some("no-peers")
        } else {
            None
        };

        if cleanup && job.status == JobStatus::Error && handle.is_some() {
            let key = SessionKey::for_source(&job.source);
            match self.ctx.registry.release_for(&key, job_id).await {
                Ok(removed) => info!(job_id = %job_id, removed, "Cleaned up failed job session"),
                Err(e) => warn!(job_id = %job_id, error = %e, "Session cleanup failed"),
            }
        }

        Ok(StatusReport {
            id: job.id,
            status: job.status,
            playable: job.playable,
            progress: job.progress,
            swarm,
            variants,
            problem,
        })
    }

    /// Master manifest of a job.
    ///
    /// # Errors
    ///
    /// - `ServiceError::JobNotFound` - Unknown job id
    /// - `ServiceError::Manifest` - No rendition has output yet
    pub async fn master_manifest(&self, job_id: JobId) -> Result<String, ServiceError> {
        self.ctx.store.get(job_id).await?;
        let store = self.segment_store(job_id);
        Ok(self.manifests.master(&store, &self.base_url(job_id))?)
    }

    /// Media manifest of one rendition of a job.
    ///
    /// # Errors
    ///
    /// - `ServiceError::JobNotFound` - Unknown job id
    /// - `ServiceError::Manifest` - Unknown rendition or no segments yet
    pub async fn media_manifest(&self, job_id: JobId, rendition: &str) -> Result<String, ServiceError> {
        let job = self.ctx.store.get(job_id).await?;
        let store = self.segment_store(job_id);
        Ok(self
            .manifests
            .media(&store, rendition, job.status, &self.base_url(job_id))?)
    }

    /// Readiness probe behind `HEAD .../playlist`.
    ///
    /// # Errors
    ///
    /// - `ServiceError::JobNotFound` - Unknown job id
    pub async fn playlist_probe(&self, job_id: JobId) -> Result<PlaylistProbe, ServiceError> {
        let job = self.ctx.store.get(job_id).await?;
        if job.status == JobStatus::Error {
            return Ok(PlaylistProbe::Gone);
        }
        let store = self.segment_store(job_id);
        if self.manifests.available_renditions(&store).is_empty() {
            Ok(PlaylistProbe::NotReady)
        } else {
            Ok(PlaylistProbe::Ready)
        }
    }

    /// On-disk path of a segment file. The file itself may not exist yet.
    ///
    /// # Errors
    ///
    /// - `ServiceError::InvalidSegmentName` - Name escapes the rendition directory or is not a segment
    /// - `ServiceError::Manifest` - Unknown rendition
    /// - `ServiceError::JobNotFound` - Unknown job id
    pub async fn segment_path(
        &self,
        job_id: JobId,
        rendition: &str,
        file: &str,
    ) -> Result<PathBuf, ServiceError> {
        if file.contains("..") || file.contains('/') || file.contains('\\') {
            return Err(ServiceError::InvalidSegmentName {
                name: file.to_string(),
            });
        }
        if !is_segment_file(file) {
            return Err(ServiceError::InvalidSegmentName {
                name: file.to_string(),
            });
        }
        if find_rendition(self.manifests.ladder(), rendition).is_none() {
            return Err(ManifestError::UnknownRendition {
                name: rendition.to_string(),
            }
            .into());
        }

        self.ctx.store.get(job_id).await?;
        Ok(self.segment_store(job_id).rendition_dir(rendition).join(file))
    }

    /// Soft reset: releases the session, deletes every artifact and puts the
    /// job back to `PENDING` with its source descriptor kept.
    ///
    /// # Errors
    ///
    /// - `ServiceError::JobActive` - A pipeline worker is running
    /// - `ServiceError::JobNotFound` - Unknown job id
    /// - `ServiceError::Io` - Artifacts could not be deleted
    pub async fn reset(&self, job_id: JobId) -> Result<Job, ServiceError> {
        if self.is_active(job_id) {
            return Err(ServiceError::JobActive { id: job_id });
        }
        let job = self.ctx.store.get(job_id).await?;

        let key = SessionKey::for_source(&job.source);
        if let Err(e) = self.ctx.registry.release_for(&key, job_id).await {
            warn!(job_id = %job_id, error = %e, "Session release failed during reset");
        }

        let job_dir = self.ctx.job_dir(job_id);
        match tokio::fs::remove_dir_all(&job_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(ServiceError::Io {
                    path: job_dir,
                    source,
                });
            }
        }

        let job = self.ctx.store.reset(job_id).await?;
        info!(job_id = %job_id, "Job reset");
        Ok(job)
    }

    fn segment_store(&self, job_id: JobId) -> FsSegmentStore {
        FsSegmentStore::new(self.ctx.job_dir(job_id))
    }
}
