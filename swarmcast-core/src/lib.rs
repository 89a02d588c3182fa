//! Swarmcast Core - progressive torrent-to-HLS transcoding
//!
//! Turns media that is still arriving over a peer-to-peer transfer into an
//! adaptive-bitrate HLS stream: download sessions, gated segment transcoding,
//! manifests that grow with the on-disk state, and a finalization pass that
//! replaces progressive output with a canonical package.

pub mod config;
pub mod jobs;
pub mod manifest;
pub mod pipeline;
pub mod service;
pub mod session;
pub mod simulation;
pub mod tracing_setup;
pub mod transcode;

// Re-export main types for convenient access
pub use config::SwarmcastConfig;
pub use jobs::{InMemoryJobStore, Job, JobId, JobStatus, JobStore, JobStoreError};
pub use manifest::{ManifestBuilder, ManifestError};
pub use pipeline::{PipelineContext, PipelineController, PipelineError, PipelineReport};
pub use service::{PlaylistProbe, ServiceError, StatusReport, StreamService};
pub use session::{RqbitBackend, SessionError, SessionRegistry};
pub use transcode::{EncoderError, FfmpegEncoder, TranscodeError};

/// Errors that can bubble up from any Swarmcast subsystem.
#[derive(Debug, thiserror::Error)]
pub enum SwarmcastError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Transcode error: {0}")]
    Transcode(#[from] TranscodeError),

    #[error("Encoder error: {0}")]
    Encoder(#[from] EncoderError),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Job store error: {0}")]
    Store(#[from] JobStoreError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SwarmcastError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            SwarmcastError::Pipeline(e) => match e {
                PipelineError::MetadataTimeout { diagnostics, .. } => format!(
                    "Could not fetch torrent metadata ({} seeds, {} peers)",
                    diagnostics.seeds, diagnostics.peers
                ),
                PipelineError::HeaderTimeout { .. } => {
                    "Media download stalled before playback could start".to_string()
                }
                PipelineError::DurationUnavailable { .. } => {
                    "Could not read the media duration".to_string()
                }
                PipelineError::EncoderFatal { .. } => "Transcoding failed".to_string(),
                _ => "Stream preparation failed".to_string(),
            },
            SwarmcastError::Service(e) => match e {
                ServiceError::JobNotFound { id } => format!("Job {id} not found"),
                ServiceError::JobActive { .. } => "Job is still being processed".to_string(),
                ServiceError::InvalidRequest { reason } => format!("Invalid request: {reason}"),
                ServiceError::Manifest(ManifestError::Pending) => {
                    "Stream is not ready yet".to_string()
                }
                _ => "Streaming error occurred".to_string(),
            },
            SwarmcastError::Session(_) => "Download session error occurred".to_string(),
            SwarmcastError::Transcode(_) | SwarmcastError::Encoder(_) => {
                "Transcoding error occurred".to_string()
            }
            SwarmcastError::Manifest(_) => "Playlist error occurred".to_string(),
            SwarmcastError::Store(_) => "Job storage error occurred".to_string(),
            SwarmcastError::Configuration { reason } => format!("Configuration error: {reason}"),
            SwarmcastError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            SwarmcastError::Configuration { .. }
                | SwarmcastError::Service(ServiceError::InvalidRequest { .. })
                | SwarmcastError::Service(ServiceError::InvalidSegmentName { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, SwarmcastError>;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::session::SwarmDiagnostics;

    #[test]
    fn test_user_messages() {
        let err: SwarmcastError = PipelineError::MetadataTimeout {
            waited: Duration::from_secs(120),
            diagnostics: SwarmDiagnostics {
                seeds: 0,
                peers: 2,
                ..Default::default()
            },
        }
        .into();
        assert_eq!(
            err.user_message(),
            "Could not fetch torrent metadata (0 seeds, 2 peers)"
        );
        assert!(!err.is_user_error());

        let err: SwarmcastError = ServiceError::InvalidRequest {
            reason: "source is required".to_string(),
        }
        .into();
        assert_eq!(err.user_message(), "Invalid request: source is required");
        assert!(err.is_user_error());
    }
}
