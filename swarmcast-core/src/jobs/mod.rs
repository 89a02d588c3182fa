//! Job records: what was requested, where it stands, and why it failed.

pub mod store;

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use store::{InMemoryJobStore, JobStore, JobStoreError};

use crate::session::SwarmDiagnostics;

/// Unique identifier of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generates a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Pipeline state of a job.
///
/// `Ready` and `Error` are terminal for a pipeline run; both may be reset
/// back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    AcquiringMetadata,
    Downloading,
    DownloadingAndTranscoding,
    Ready,
    Error,
}

impl JobStatus {
    /// Whether a pipeline run has ended in this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Ready | JobStatus::Error)
    }

    /// Whether a worker is expected to be driving the job in this state.
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            JobStatus::AcquiringMetadata
                | JobStatus::Downloading
                | JobStatus::DownloadingAndTranscoding
        )
    }

    /// Legal edges of the job state machine. Staying in place is always legal.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;

        if self == next {
            return true;
        }
        match (self, next) {
            (Pending, AcquiringMetadata) => true,
            (AcquiringMetadata, Downloading) => true,
            (Downloading, DownloadingAndTranscoding) => true,
            (DownloadingAndTranscoding, Ready) => true,
            (Ready | Error, Pending) => true,
            (from, Error) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::AcquiringMetadata => "ACQUIRING_METADATA",
            JobStatus::Downloading => "DOWNLOADING",
            JobStatus::DownloadingAndTranscoding => "DOWNLOADING_AND_TRANSCODING",
            JobStatus::Ready => "READY",
            JobStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job ended in `Error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    /// Stable error kind, e.g. `metadata_timeout`
    pub kind: String,
    pub message: String,
    /// Swarm state captured when the failure was recorded
    pub diagnostics: Option<SwarmDiagnostics>,
}

/// One requested title and its pipeline state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub external_id: String,
    pub source: String,
    pub status: JobStatus,
    pub playable: bool,
    pub progress: f64,
    pub resolved_path: Option<PathBuf>,
    pub duration: Option<f64>,
    pub failure: Option<JobFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Creates a `Pending` job for the given external id and source descriptor.
    pub fn new(external_id: impl Into<String>, source: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            external_id: external_id.into(),
            source: source.into(),
            status: JobStatus::Pending,
            playable: false,
            progress: 0.0,
            resolved_path: None,
            duration: None,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies a partial update.
    ///
    /// Progress is clamped to `0..=100` and never moves backwards. The status
    /// edge is not validated here; stores check it with
    /// [`JobStatus::can_transition_to`] before applying.
    pub fn apply(&mut self, update: JobUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(playable) = update.playable {
            self.playable = playable;
        }
        if let Some(progress) = update.progress {
            let progress = progress.clamp(0.0, 100.0);
            if progress > self.progress {
                self.progress = progress;
            }
        }
        if let Some(path) = update.resolved_path {
            self.resolved_path = Some(path);
        }
        if let Some(duration) = update.duration {
            self.duration = Some(duration);
        }
        if update.clear_failure {
            self.failure = None;
        }
        if let Some(failure) = update.failure {
            self.failure = Some(failure);
        }
        self.updated_at = Utc::now();
    }

    /// Soft reset: back to `Pending` with everything except identity and source cleared.
    pub fn reset(&mut self) {
        self.status = JobStatus::Pending;
        self.playable = false;
        self.progress = 0.0;
        self.resolved_path = None;
        self.duration = None;
        self.failure = None;
        self.updated_at = Utc::now();
    }
}

/// Partial update of a [`Job`]; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub playable: Option<bool>,
    pub progress: Option<f64>,
    pub resolved_path: Option<PathBuf>,
    pub duration: Option<f64>,
    pub failure: Option<JobFailure>,
    /// Drops the recorded failure; applied before `failure`
    pub clear_failure: bool,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn progress(progress: f64) -> Self {
        Self {
            progress: Some(progress),
            ..Default::default()
        }
    }

    /// Back to `Pending` for another run: the previous failure and playable
    /// flag are dropped, progress and resolved path are kept.
    pub fn restart() -> Self {
        Self {
            status: Some(JobStatus::Pending),
            playable: Some(false),
            clear_failure: true,
            ..Default::default()
        }
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_playable(mut self, playable: bool) -> Self {
        self.playable = Some(playable);
        self
    }

    pub fn with_resolved_path(mut self, path: PathBuf) -> Self {
        self.resolved_path = Some(path);
        self
    }

    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_failure(mut self, failure: JobFailure) -> Self {
        self.failure = Some(failure);
        self
    }
}
