//! Per-job download tracking: bounded waits, monotonic progress and swarm
//! diagnostics cadence.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use super::PipelineError;
use crate::config::PipelineConfig;
use crate::jobs::JobId;
use crate::session::{DownloadSessionHandle, SwarmStatus, TransferMetadata};

/// Bytes that must be on disk, and not all zero, before the encoder may probe.
pub const HEADER_BYTES: usize = 1024;

/// One poll of the transfer.
#[derive(Debug, Clone, Copy)]
pub struct ProgressSample {
    pub status: SwarmStatus,
    /// Monotonic progress percent
    pub progress: f64,
    /// Transfer seeds or reports 100 %
    pub complete: bool,
}

/// Watches one download session on behalf of a pipeline run.
pub struct DownloadMonitor {
    job_id: JobId,
    handle: Arc<DownloadSessionHandle>,
    config: PipelineConfig,
    progress: f64,
    last_diagnostics: Option<Instant>,
    last_persist: Option<Instant>,
}

impl DownloadMonitor {
    pub fn new(job_id: JobId, handle: Arc<DownloadSessionHandle>, config: PipelineConfig) -> Self {
        Self {
            job_id,
            handle,
            config,
            progress: 0.0,
            last_diagnostics: None,
            last_persist: None,
        }
    }

    /// Polls the transfer. Reported progress never goes backwards.
    pub fn sample(&mut self) -> ProgressSample {
        let status = self.handle.status();
        let observed = status.progress_percent();
        if observed > self.progress {
            self.progress = observed;
        } else if observed < self.progress {
            debug!(
                job_id = %self.job_id,
                observed,
                kept = self.progress,
                "Ignoring progress regression"
            );
        }

        ProgressSample {
            status,
            progress: self.progress,
            complete: status.is_complete() || self.progress >= 100.0,
        }
    }

    /// Polls until the transfer metadata is known.
    ///
    /// # Errors
    ///
    /// - `PipelineError::MetadataTimeout` - No metadata within `metadata_timeout`
    /// - `PipelineError::SessionUnavailable` - Backend gave up attaching the transfer
    pub async fn wait_for_metadata(&self) -> Result<TransferMetadata, PipelineError> {
        let started = Instant::now();
        loop {
            if let Some(metadata) = self.handle.metadata() {
                info!(
                    job_id = %self.job_id,
                    name = %metadata.name,
                    files = metadata.files.len(),
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Transfer metadata received"
                );
                return Ok(metadata);
            }
            if let Some(reason) = self.handle.attach_error() {
                return Err(PipelineError::SessionUnavailable { reason });
            }
            if started.elapsed() >= self.config.metadata_timeout {
                return Err(PipelineError::MetadataTimeout {
                    waited: started.elapsed(),
                    diagnostics: self.handle.diagnostics(),
                });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Requests in-order acquisition and raises the leading pieces.
    pub fn start_sequential(&self) {
        self.handle.set_sequential(true);
        self.handle
            .prioritize_pieces(0..self.config.header_priority_pieces);
        debug!(
            job_id = %self.job_id,
            pieces = self.config.header_priority_pieces,
            "Sequential acquisition requested"
        );
    }

    /// Waits until the media header is on disk.
    ///
    /// # Errors
    ///
    /// - `PipelineError::HeaderTimeout` - Header not present within `header_timeout`
    pub async fn wait_for_header(&self, path: &Path) -> Result<(), PipelineError> {
        let started = Instant::now();
        loop {
            if header_ready(path).await {
                info!(
                    job_id = %self.job_id,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Media header on disk"
                );
                return Ok(());
            }
            if started.elapsed() >= self.config.header_timeout {
                return Err(PipelineError::HeaderTimeout {
                    path: path.to_path_buf(),
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// True at most once per `diagnostics_interval`.
    pub fn diagnostics_due(&mut self, now: Instant) -> bool {
        due(&mut self.last_diagnostics, now, self.config.diagnostics_interval)
    }

    /// True at most once per `persist_interval`.
    pub fn persist_due(&mut self, now: Instant) -> bool {
        due(&mut self.last_persist, now, self.config.persist_interval)
    }

    pub fn log_diagnostics(&self, sample: &ProgressSample) {
        info!(
            job_id = %self.job_id,
            progress = format_args!("{:.1}", sample.progress),
            seeds = sample.status.seeds,
            peers = sample.status.peers,
            down_kbps = format_args!("{:.0}", sample.status.download_kbps),
            seeding = sample.status.seeding,
            "Swarm"
        );
    }
}

fn due(last: &mut Option<Instant>, now: Instant, every: std::time::Duration) -> bool {
    match last {
        Some(previous) if now.saturating_duration_since(*previous) < every => false,
        _ => {
            *last = Some(now);
            true
        }
    }
}

/// The file exists, is larger than [`HEADER_BYTES`] and its first
/// [`HEADER_BYTES`] bytes are not all zero.
pub async fn header_ready(path: &Path) -> bool {
    let Ok(meta) = tokio::fs::metadata(path).await else {
        return false;
    };
    if meta.len() <= HEADER_BYTES as u64 {
        return false;
    }

    let Ok(mut file) = tokio::fs::File::open(path).await else {
        return false;
    };
    let mut header = [0u8; HEADER_BYTES];
    if file.read_exact(&mut header).await.is_err() {
        return false;
    }
    header.iter().any(|byte| *byte != 0)
}
