//! Per-job pipeline: metadata, header gate, live transcoding while the
//! transfer progresses, catch-up once it completes, then finalization.

pub mod error;
pub mod gating;
pub mod monitor;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use tracing::{debug, error, info, warn};

pub use error::PipelineError;
pub use gating::{SegmentPlan, SegmentSlice};
pub use monitor::{DownloadMonitor, ProgressSample, header_ready};

use crate::config::SwarmcastConfig;
use crate::jobs::{JobFailure, JobId, JobStatus, JobStore, JobStoreError, JobUpdate};
use crate::session::{SessionKey, SessionRegistry};
use crate::transcode::{
    Encoder, PackageReport, Packager, RetryLedger, SegmentStore, SegmentTranscoder, SourceMedia,
};

/// Shared dependencies of every pipeline run.
pub struct PipelineContext {
    pub config: SwarmcastConfig,
    pub store: Arc<dyn JobStore>,
    pub registry: Arc<SessionRegistry>,
    pub encoder: Arc<dyn Encoder>,
}

impl PipelineContext {
    pub fn new(
        config: SwarmcastConfig,
        store: Arc<dyn JobStore>,
        registry: Arc<SessionRegistry>,
        encoder: Arc<dyn Encoder>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            encoder,
        }
    }

    pub fn job_dir(&self, job_id: JobId) -> PathBuf {
        self.config.storage.job_dir(job_id)
    }
}

/// Outcome of a run that reached `READY`.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    pub job_id: JobId,
    pub segment_count: u32,
    /// Indices given up after exhausting their retry budget
    pub failed_indices: Vec<u32>,
    pub package: PackageReport,
}

/// Live-phase bookkeeping of one run.
#[derive(Debug, Default)]
struct LiveState {
    plan: Option<SegmentPlan>,
    next_index: u32,
    playable: bool,
}

/// Drives one job through the state machine. The sole writer of a job's
/// status and progress while it runs.
pub struct PipelineController {
    ctx: Arc<PipelineContext>,
}

impl PipelineController {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    /// Runs a `PENDING` job to `READY` or `ERROR`.
    ///
    /// On a fatal error the failure is recorded on the job and its download
    /// session is released before the error is returned.
    ///
    /// # Errors
    /// Any job-fatal [`PipelineError`].
    pub async fn run(&self, job_id: JobId) -> Result<PipelineReport, PipelineError> {
        info!(job_id = %job_id, "Pipeline started");
        match self.execute(job_id).await {
            Ok(report) => {
                info!(
                    job_id = %job_id,
                    segments = report.segment_count,
                    failed = ?report.failed_indices,
                    "Pipeline finished"
                );
                Ok(report)
            }
            Err(e) => {
                self.fail(job_id, &e).await;
                Err(e)
            }
        }
    }

    async fn execute(&self, job_id: JobId) -> Result<PipelineReport, PipelineError> {
        let ctx = &self.ctx;
        let job = ctx.store.get(job_id).await.map_err(|e| match e {
            JobStoreError::NotFound { id } => PipelineError::JobNotFound { id },
            other => PipelineError::Store(other),
        })?;

        ctx.store
            .update(job_id, JobUpdate::status(JobStatus::AcquiringMetadata))
            .await?;

        let job_dir = ctx.job_dir(job_id);
        tokio::fs::create_dir_all(&job_dir)
            .await
            .map_err(|source| PipelineError::Io {
                path: job_dir.clone(),
                source,
            })?;

        let handle = ctx
            .registry
            .open(&job.source, &job_dir)
            .await
            .map_err(|e| PipelineError::SessionUnavailable {
                reason: e.to_string(),
            })?;
        handle.hold(job_id);
        let mut monitor =
            DownloadMonitor::new(job_id, Arc::clone(&handle), ctx.config.pipeline.clone());

        let metadata = monitor.wait_for_metadata().await?;
        let media = metadata
            .largest_file()
            .ok_or_else(|| PipelineError::SessionUnavailable {
                reason: "transfer contains no files".to_string(),
            })?;
        // A transfer shared with another job keeps the save path it was opened with.
        let media_path = handle.save_path().join(&media.relative_path);

        ctx.store
            .update(
                job_id,
                JobUpdate::status(JobStatus::Downloading).with_resolved_path(media_path.clone()),
            )
            .await?;
        info!(
            job_id = %job_id,
            media = %media_path.display(),
            bytes = media.length,
            "Media file selected"
        );

        monitor.start_sequential();
        monitor.wait_for_header(&media_path).await?;

        let transcoder = SegmentTranscoder::new(
            Arc::clone(&ctx.encoder),
            &job_dir,
            ctx.config.pipeline.segment_duration,
            ctx.config.transcode.renditions.clone(),
        )
        .with_safety_margin(ctx.config.pipeline.safety_margin_percent);
        let ledger = RetryLedger::new(
            ctx.config.transcode.max_retries,
            ctx.config.transcode.retry_cooldown,
        );
        let mut live = LiveState::default();

        loop {
            let sample = monitor.sample();
            let now = Instant::now();
            if monitor.diagnostics_due(now) {
                monitor.log_diagnostics(&sample);
            }

            if live.plan.is_none() {
                if let Some(duration) = ctx.encoder.probe_duration(&media_path).await {
                    live.plan = Some(self.begin_transcoding(job_id, &transcoder, duration).await?);
                }
            }

            if !sample.complete {
                if let Some(plan) = live.plan {
                    let source = SourceMedia {
                        path: media_path.clone(),
                        duration: plan.total_duration(),
                    };
                    self.live_step(job_id, &transcoder, &ledger, &plan, &source, &sample, &mut live)
                        .await?;
                }
            }

            if monitor.persist_due(now) {
                ctx.store
                    .update(job_id, JobUpdate::progress(sample.progress))
                    .await?;
            }

            if sample.complete {
                ctx.store.update(job_id, JobUpdate::progress(100.0)).await?;
                info!(job_id = %job_id, "Transfer complete");
                break;
            }
            tokio::time::sleep(ctx.config.pipeline.poll_interval).await;
        }

        let plan = match live.plan {
            Some(plan) => plan,
            None => {
                let duration = ctx
                    .encoder
                    .probe_duration(&media_path)
                    .await
                    .ok_or_else(|| PipelineError::DurationUnavailable {
                        path: media_path.clone(),
                    })?;
                self.begin_transcoding(job_id, &transcoder, duration).await?
            }
        };
        let source = SourceMedia {
            path: media_path.clone(),
            duration: plan.total_duration(),
        };

        let catch_up_failures = self.catch_up(job_id, &transcoder, &ledger, &plan, &source).await;
        if let Some(fatal) = catch_up_failures
            .into_iter()
            .map(|(_, err)| err)
            .find(PipelineError::is_job_fatal)
        {
            return Err(fatal);
        }

        if !live.playable && index_complete(&transcoder, 0) {
            self.mark_playable(job_id, &mut live).await?;
        }

        let package = self.finalize(job_id, &job_dir, &media_path).await;

        ctx.store
            .update(
                job_id,
                JobUpdate::status(JobStatus::Ready)
                    .with_progress(100.0)
                    .with_playable(live.playable),
            )
            .await?;
        handle.unhold(job_id);

        Ok(PipelineReport {
            job_id,
            segment_count: plan.segment_count(),
            failed_indices: ledger.failed_indices(),
            package,
        })
    }

    async fn begin_transcoding(
        &self,
        job_id: JobId,
        transcoder: &SegmentTranscoder,
        duration: f64,
    ) -> Result<SegmentPlan, PipelineError> {
        let plan = transcoder.plan(duration);
        self.ctx
            .store
            .update(
                job_id,
                JobUpdate::status(JobStatus::DownloadingAndTranscoding).with_duration(duration),
            )
            .await?;
        info!(
            job_id = %job_id,
            duration,
            segments = plan.segment_count(),
            "Duration probed, transcoding enabled"
        );
        Ok(plan)
    }

    /// Produces every index whose bytes are safely on disk, in order.
    #[allow(clippy::too_many_arguments)]
    async fn live_step(
        &self,
        job_id: JobId,
        transcoder: &SegmentTranscoder,
        ledger: &RetryLedger,
        plan: &SegmentPlan,
        source: &SourceMedia,
        sample: &ProgressSample,
        live: &mut LiveState,
    ) -> Result<(), PipelineError> {
        while live.next_index < plan.segment_count() {
            let index = live.next_index;
            if ledger.is_failed(index) {
                live.next_index += 1;
                continue;
            }
            if !plan.is_ready(index, sample.progress, sample.status.seeding) {
                break;
            }
            if !ledger.can_attempt(index, Instant::now()) {
                break;
            }

            match transcoder.produce_all(source, index).await {
                Ok(_) => {
                    if index == 0 && !live.playable {
                        self.mark_playable(job_id, live).await?;
                    }
                    live.next_index += 1;
                }
                Err(e) => match PipelineError::from(e) {
                    // Not counted while the transfer is still running.
                    err @ PipelineError::EncoderRetryable { .. } => {
                        debug!(job_id = %job_id, index, error = %err, "Segment waits for more data");
                        break;
                    }
                    err @ PipelineError::EncoderFatal { .. } => {
                        if !ledger.record_failure(index, Instant::now()) {
                            warn!(
                                job_id = %job_id,
                                index,
                                failures = ledger.failures(index),
                                error = %err,
                                "Segment attempt failed, cooling down"
                            );
                            break;
                        }
                        warn!(job_id = %job_id, index, error = %err, "Segment failed permanently");
                        if err.is_job_fatal() {
                            return Err(err);
                        }
                        live.next_index += 1;
                    }
                    other => return Err(other),
                },
            }
        }
        Ok(())
    }

    /// Produces every remaining index with bounded concurrency. Returns the
    /// indices that failed permanently with their error.
    async fn catch_up(
        &self,
        job_id: JobId,
        transcoder: &SegmentTranscoder,
        ledger: &RetryLedger,
        plan: &SegmentPlan,
        source: &SourceMedia,
    ) -> Vec<(u32, PipelineError)> {
        let pending: Vec<u32> = (0..plan.segment_count())
            .filter(|index| !ledger.is_failed(*index) && !index_complete(transcoder, *index))
            .collect();
        if pending.is_empty() {
            return Vec::new();
        }

        let workers = self.ctx.config.pipeline.catchup_workers.max(1);
        info!(job_id = %job_id, pending = pending.len(), workers, "Catch-up started");

        let results: Vec<(u32, Result<(), PipelineError>)> = futures::stream::iter(pending)
            .map(|index| async move {
                (index, produce_with_retries(transcoder, ledger, source, index).await)
            })
            .buffer_unordered(workers)
            .collect()
            .await;

        let mut failures: Vec<(u32, PipelineError)> = results
            .into_iter()
            .filter_map(|(index, result)| result.err().map(|reason| (index, reason)))
            .collect();
        failures.sort_by_key(|(index, _)| *index);

        if !failures.is_empty() {
            warn!(
                job_id = %job_id,
                failed = ?failures.iter().map(|(index, _)| *index).collect::<Vec<_>>(),
                "Catch-up left gaps"
            );
        }
        failures
    }

    async fn finalize(&self, job_id: JobId, job_dir: &Path, media_path: &Path) -> PackageReport {
        let packager = Packager::new(
            Arc::clone(&self.ctx.encoder),
            job_dir,
            self.ctx.config.pipeline.segment_duration,
        );
        let report = packager
            .package_all(media_path, &self.ctx.config.transcode.renditions)
            .await;
        for (rendition, reason) in &report.failed {
            let err = PipelineError::Finalization {
                rendition: rendition.clone(),
                reason: reason.clone(),
            };
            warn!(
                job_id = %job_id,
                kind = err.kind(),
                fatal = err.is_job_fatal(),
                error = %err,
                "Finalization incomplete, progressive segments stay authoritative"
            );
        }
        report
    }

    async fn mark_playable(&self, job_id: JobId, live: &mut LiveState) -> Result<(), PipelineError> {
        self.ctx
            .store
            .update(job_id, JobUpdate::default().with_playable(true))
            .await?;
        live.playable = true;
        info!(job_id = %job_id, "First segment ready, job playable");
        Ok(())
    }

    async fn fail(&self, job_id: JobId, err: &PipelineError) {
        let source = self.ctx.store.get(job_id).await.ok().map(|job| job.source);
        let handle = match &source {
            Some(source) => self.ctx.registry.lookup_source(source).await,
            None => None,
        };

        let diagnostics = err
            .diagnostics()
            .cloned()
            .or_else(|| handle.as_ref().map(|handle| handle.diagnostics()));
        error!(
            job_id = %job_id,
            kind = err.kind(),
            error = %err,
            seeds = diagnostics.as_ref().map_or(0, |d| d.seeds),
            peers = diagnostics.as_ref().map_or(0, |d| d.peers),
            down_kbps = diagnostics.as_ref().map_or(0.0, |d| d.down_kbps),
            "Pipeline failed"
        );

        let failure = JobFailure {
            kind: err.kind().to_string(),
            message: err.to_string(),
            diagnostics,
        };
        if let Err(e) = self
            .ctx
            .store
            .update(job_id, JobUpdate::status(JobStatus::Error).with_failure(failure))
            .await
        {
            warn!(job_id = %job_id, error = %e, "Could not record job failure");
        }

        if let Some(source) = source {
            let key = SessionKey::for_source(&source);
            if let Err(e) = self.ctx.registry.release_for(&key, job_id).await {
                warn!(job_id = %job_id, error = %e, "Could not release download session");
            }
        }
    }
}

fn index_complete(transcoder: &SegmentTranscoder, index: u32) -> bool {
    transcoder
        .ladder()
        .iter()
        .all(|rendition| transcoder.store().has_segment(&rendition.name, index))
}

/// Catch-up attempt loop: every failure counts now that the source is whole,
/// so an exhausted index is reported as a permanent encoder failure.
async fn produce_with_retries(
    transcoder: &SegmentTranscoder,
    ledger: &RetryLedger,
    source: &SourceMedia,
    index: u32,
) -> Result<(), PipelineError> {
    loop {
        let Some(wait) = ledger.wait_before_attempt(index, Instant::now()) else {
            return Err(PipelineError::EncoderFatal {
                index,
                reason: "retry budget exhausted".to_string(),
            });
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
            continue;
        }

        match transcoder.produce_all(source, index).await {
            Ok(_) => return Ok(()),
            Err(e) => {
                let permanent = ledger.record_failure(index, Instant::now());
                warn!(
                    index,
                    failures = ledger.failures(index),
                    permanent,
                    error = %e,
                    "Catch-up attempt failed"
                );
                if permanent {
                    return Err(PipelineError::EncoderFatal {
                        index,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }
}
