//! Cluster-visible job lifecycle records.
//!
//! Status lives in the state store under `job:<job_id>`. Every write is a
//! read-merge-write where the merge only ever moves flags forward, so a
//! stale writer cannot revert a job that another node already finished.

use std::fmt::{self, Display};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipesError;
use crate::item::JobId;
use crate::retry::{with_retries, StoreRetryConfig};
use crate::state::{Namespace, StateStore};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Created,
    Running,
    Completed,
    CompletedWithErrors,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::CompletedWithErrors => "completed_with_errors",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::CompletedWithErrors)
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub running: bool,
    pub completed: bool,
    pub has_error: bool,
    #[serde(default)]
    pub items_reported: u64,
    pub updated_at: DateTime<Utc>,
}

impl JobStatus {
    pub fn created(job_id: JobId) -> Self {
        Self {
            job_id,
            running: false,
            completed: false,
            has_error: false,
            items_reported: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn state(&self) -> JobState {
        match (self.completed, self.running, self.has_error) {
            (true, _, true) => JobState::CompletedWithErrors,
            (true, _, false) => JobState::Completed,
            (false, true, _) => JobState::Running,
            (false, false, _) => JobState::Created,
        }
    }

    /// Combine two observations of the same job. Flags only move forward:
    /// `completed` and `has_error` latch, and `running` clears once the job
    /// has completed.
    pub fn merge(&self, other: &JobStatus) -> JobStatus {
        let completed = self.completed || other.completed;
        JobStatus {
            job_id: self.job_id,
            running: !completed && (self.running || other.running),
            completed,
            has_error: self.has_error || other.has_error,
            items_reported: self.items_reported.max(other.items_reported),
            updated_at: self.updated_at.max(other.updated_at),
        }
    }
}

/// Reads and monotonically updates [`JobStatus`] records.
///
/// Each store call is retried per [`StoreRetryConfig`] before surfacing
/// [`PipesError::StateStore`].
#[derive(Clone)]
pub struct JobStatusTracker {
    store: Arc<dyn StateStore>,
    retry: StoreRetryConfig,
}

impl fmt::Debug for JobStatusTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobStatusTracker")
            .field("retry", &self.retry)
            .finish()
    }
}

impl JobStatusTracker {
    pub fn new(store: Arc<dyn StateStore>, retry: StoreRetryConfig) -> Self {
        Self { store, retry }
    }

    /// Record a new job in the `CREATED` state.
    pub async fn create(&self, job_id: JobId) -> Result<JobStatus, PipesError> {
        self.upsert(JobStatus::created(job_id)).await
    }

    pub async fn mark_running(&self, job_id: JobId) -> Result<JobStatus, PipesError> {
        let mut status = JobStatus::created(job_id);
        status.running = true;
        self.upsert(status).await
    }

    /// Latch `has_error` for the job.
    pub async fn record_error(&self, job_id: JobId) -> Result<JobStatus, PipesError> {
        let mut status = JobStatus::created(job_id);
        status.has_error = true;
        self.upsert(status).await
    }

    pub async fn complete(
        &self,
        job_id: JobId,
        has_error: bool,
        items_reported: u64,
    ) -> Result<JobStatus, PipesError> {
        let mut status = JobStatus::created(job_id);
        status.completed = true;
        status.has_error = has_error;
        status.items_reported = items_reported;
        self.upsert(status).await
    }

    pub async fn get(&self, job_id: JobId) -> Result<Option<JobStatus>, PipesError> {
        let key = Namespace::Job.key(job_id);
        self.read(&key).await
    }

    /// Every job status in the store, oldest first.
    pub async fn list_jobs(&self) -> Result<Vec<JobStatus>, PipesError> {
        let store = &self.store;
        let keys = with_retries(&self.retry, "list_keys", Namespace::Job.as_str(), || {
            store.list_keys()
        })
        .await?;

        let mut jobs = Vec::new();
        for key in keys.iter().filter(|key| Namespace::Job.strip(key).is_some()) {
            if let Some(status) = self.read(key).await? {
                jobs.push(status);
            }
        }
        jobs.sort_by_key(|status| status.job_id.0);
        Ok(jobs)
    }

    async fn read(&self, key: &str) -> Result<Option<JobStatus>, PipesError> {
        let store = &self.store;
        let Some(bytes) = with_retries(&self.retry, "get", key, || store.get(key)).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(status) => Ok(Some(status)),
            Err(err) => {
                tracing::warn!(key, "ignoring unreadable job status: {err}");
                Ok(None)
            }
        }
    }

    async fn upsert(&self, update: JobStatus) -> Result<JobStatus, PipesError> {
        let key = Namespace::Job.key(update.job_id);
        let merged = match self.read(&key).await? {
            Some(current) => current.merge(&update),
            None => update,
        };

        let bytes = serde_json::to_vec(&merged)?;
        let store = &self.store;
        with_retries(&self.retry, "put", &key, || store.put(&key, bytes.clone())).await?;

        tracing::debug!(job_id = %merged.job_id, state = %merged.state(), "job status updated");
        Ok(merged)
    }
}
