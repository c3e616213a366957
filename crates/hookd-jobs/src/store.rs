//! Job store contract and in-memory backend.

use std::collections::BTreeMap;

use async_trait::async_trait;
use hookd_core::current_unix_timestamp_ms;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::{Job, JobStatus, JOB_DATA_ERROR_KEY};

/// Result type for job store operations.
pub type JobStoreResult<T> = Result<T, JobStoreError>;

/// Errors returned by store implementations.
#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("job '{0}' already exists")]
    AlreadyExists(String),
    #[error("job '{0}' not found")]
    NotFound(String),
    #[error("invalid job status transition for '{id}': {from:?} -> {to:?}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("invalid persisted value for '{field}': {value}")]
    InvalidPersistedValue { field: &'static str, value: String },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Shared job ledger.
///
/// Status only changes through [`claim`](JobStore::claim) and the terminal
/// [`set_success`](JobStore::set_success)/[`set_error`](JobStore::set_error)
/// transitions. Records are never deleted.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn save(&self, job: Job) -> JobStoreResult<()>;

    async fn get(&self, id: &str) -> JobStoreResult<Option<Job>>;

    /// Compare-and-set `pending -> in_progress`. Returns `false` when the job
    /// was already claimed or does not exist.
    async fn claim(&self, id: &str) -> JobStoreResult<bool>;

    async fn set_success(&self, id: &str) -> JobStoreResult<()>;

    async fn set_error(&self, id: &str, message: &str) -> JobStoreResult<()>;

    /// Jobs of `job_type` in `status`, oldest first.
    async fn list_by_type_and_status(
        &self,
        job_type: &str,
        status: JobStatus,
    ) -> JobStoreResult<Vec<Job>>;
}

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<BTreeMap<String, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn finish(&self, id: &str, next: JobStatus, message: Option<&str>) -> JobStoreResult<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| JobStoreError::NotFound(id.to_string()))?;
        if !job.status.can_transition_to(next) {
            return Err(JobStoreError::InvalidTransition {
                id: id.to_string(),
                from: job.status,
                to: next,
            });
        }
        job.status = next;
        job.last_activity_at_ms = current_unix_timestamp_ms();
        if let Some(message) = message {
            job.data
                .insert(JOB_DATA_ERROR_KEY.to_string(), message.to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn save(&self, job: Job) -> JobStoreResult<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn get(&self, id: &str) -> JobStoreResult<Option<Job>> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn claim(&self, id: &str) -> JobStoreResult<bool> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Pending {
            return Ok(false);
        }
        let now_ms = current_unix_timestamp_ms();
        job.status = JobStatus::InProgress;
        job.start_at_ms = Some(now_ms);
        job.last_activity_at_ms = now_ms;
        Ok(true)
    }

    async fn set_success(&self, id: &str) -> JobStoreResult<()> {
        self.finish(id, JobStatus::Success, None).await
    }

    async fn set_error(&self, id: &str, message: &str) -> JobStoreResult<()> {
        self.finish(id, JobStatus::Error, Some(message)).await
    }

    async fn list_by_type_and_status(
        &self,
        job_type: &str,
        status: JobStatus,
    ) -> JobStoreResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| job.job_type == job_type && job.status == status)
            .cloned()
            .collect();
        jobs.sort_by(|left, right| {
            left.create_at_ms
                .cmp(&right.create_at_ms)
                .then_with(|| left.id.cmp(&right.id))
        });
        Ok(jobs)
    }
}
