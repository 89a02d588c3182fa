//! Job persistence seam and the in-process implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use super::{Job, JobId, JobStatus, JobUpdate};

/// Errors from a job store.
#[derive(Debug, thiserror::Error)]
pub enum JobStoreError {
    #[error("Job {id} not found")]
    NotFound { id: JobId },

    #[error("Illegal job transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Job store backend error: {reason}")]
    Backend { reason: String },
}

/// Persisted status/progress record of every job.
///
/// The pipeline controller is the only writer of status and progress while a
/// job is being processed; readers may call `get` at any time.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Fetches a job by id.
    ///
    /// # Errors
    ///
    /// - `JobStoreError::NotFound` - No job with this id
    async fn get(&self, id: JobId) -> Result<Job, JobStoreError>;

    /// Returns the job for `external_id`, creating a `Pending` one if absent.
    ///
    /// An existing job keeps its original source descriptor.
    ///
    /// # Errors
    ///
    /// - `JobStoreError::Backend` - Storage failure
    async fn get_or_create(&self, external_id: &str, source: &str) -> Result<Job, JobStoreError>;

    /// Applies a partial update and returns the new record.
    ///
    /// # Errors
    ///
    /// - `JobStoreError::NotFound` - No job with this id
    /// - `JobStoreError::InvalidTransition` - Requested status edge is illegal
    async fn update(&self, id: JobId, update: JobUpdate) -> Result<Job, JobStoreError>;

    /// Soft-resets a job back to `Pending`, keeping its source descriptor.
    ///
    /// # Errors
    ///
    /// - `JobStoreError::NotFound` - No job with this id
    async fn reset(&self, id: JobId) -> Result<Job, JobStoreError>;
}

/// Job store kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs currently held.
    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn get(&self, id: JobId) -> Result<Job, JobStoreError> {
        self.jobs
            .read()
            .get(&id)
            .cloned()
            .ok_or(JobStoreError::NotFound { id })
    }

    async fn get_or_create(&self, external_id: &str, source: &str) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write();
        if let Some(existing) = jobs.values().find(|job| job.external_id == external_id) {
            return Ok(existing.clone());
        }

        let job = Job::new(external_id, source);
        debug!(job_id = %job.id, external_id, "Created job");
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn update(&self, id: JobId, update: JobUpdate) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound { id })?;

        if let Some(next) = update.status {
            if !job.status.can_transition_to(next) {
                return Err(JobStoreError::InvalidTransition {
                    from: job.status,
                    to: next,
                });
            }
        }

        job.apply(update);
        Ok(job.clone())
    }

    async fn reset(&self, id: JobId) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound { id })?;
        job.reset();
        Ok(job.clone())
    }
}
