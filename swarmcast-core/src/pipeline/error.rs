//! Pipeline failure taxonomy.

use std::path::PathBuf;
use std::time::Duration;

use crate::jobs::{JobId, JobStoreError};
use crate::session::SwarmDiagnostics;
use crate::transcode::TranscodeError;

/// Errors raised while driving a job through the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Transfer metadata not received within {}s", waited.as_secs())]
    MetadataTimeout {
        waited: Duration,
        diagnostics: SwarmDiagnostics,
    },

    #[error("Media header of {} not on disk within {}s", path.display(), waited.as_secs())]
    HeaderTimeout { path: PathBuf, waited: Duration },

    #[error("Segment {index} needs more source data")]
    EncoderRetryable { index: u32 },

    #[error("Segment {index} failed permanently: {reason}")]
    EncoderFatal { index: u32, reason: String },

    #[error("Finalization of {rendition} failed: {reason}")]
    Finalization { rendition: String, reason: String },

    #[error("Download session unavailable: {reason}")]
    SessionUnavailable { reason: String },

    #[error("Could not determine media duration of {}", path.display())]
    DurationUnavailable { path: PathBuf },

    #[error("Job {id} not found")]
    JobNotFound { id: JobId },

    #[error("I/O error on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Job store error")]
    Store(#[from] JobStoreError),
}

impl PipelineError {
    /// Whether this error ends the job in `ERROR`.
    ///
    /// A permanent failure of any index other than 0 only leaves a gap,
    /// retryable encoder errors are absorbed by the retry loop and a failed
    /// finalization leaves the progressive segments in place.
    pub fn is_job_fatal(&self) -> bool {
        match self {
            PipelineError::EncoderRetryable { .. } | PipelineError::Finalization { .. } => false,
            PipelineError::EncoderFatal { index, .. } => *index == 0,
            _ => true,
        }
    }

    /// Stable identifier stored on the job's failure record.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::MetadataTimeout { .. } => "metadata_timeout",
            PipelineError::HeaderTimeout { .. } => "header_timeout",
            PipelineError::EncoderRetryable { .. } => "encoder_retryable",
            PipelineError::EncoderFatal { .. } => "encoder_fatal",
            PipelineError::Finalization { .. } => "finalization",
            PipelineError::SessionUnavailable { .. } => "session_unavailable",
            PipelineError::DurationUnavailable { .. } => "duration_unavailable",
            PipelineError::JobNotFound { .. } => "job_not_found",
            PipelineError::Io { .. } => "io",
            PipelineError::Store(_) => "store",
        }
    }

    /// Swarm snapshot carried by the error itself, if any.
    pub fn diagnostics(&self) -> Option<&SwarmDiagnostics> {
        match self {
            PipelineError::MetadataTimeout { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }
}

impl From<TranscodeError> for PipelineError {
    fn from(err: TranscodeError) -> Self {
        match err {
            TranscodeError::Retryable { index, .. } => PipelineError::EncoderRetryable { index },
            TranscodeError::Failed { index, reason } => PipelineError::EncoderFatal { index, reason },
            TranscodeError::Packaging { rendition, reason } => {
                PipelineError::Finalization { rendition, reason }
            }
            TranscodeError::Io { path, source } => PipelineError::Io { path, source },
        }
    }
}
