//! # backlog-client - Inspection and management for the job engine
//!
//! This crate provides an `AdminClient` for the dashboard side of backlog.
//!
//! ## Features
//!
//! - **Statistics**: Job counts per state, recurring definition count
//! - **Listing**: Jobs in a given state, paginated, oldest first
//! - **History**: Every state a job went through, including retries
//! - **Job Management**: Re-enqueue failed or scheduled jobs, delete jobs
//! - **Recurring Jobs**: List, trigger now, remove
//!
//! ## Usage
//!
//! ```rust,ignore
//! use backlog_client::AdminClient;
//! use backlog_sqlite::SqliteBackend;
//!
//! #[tokio::main]
//! async fn main() -> backlog_core::Result<()> {
//!     let backend = SqliteBackend::new("sqlite:jobs.db", "myapp").await?;
//!     let admin = AdminClient::new(backend);
//!
//!     let stats = admin.stats().await?;
//!     println!("Enqueued: {}, Exhausted: {}", stats.enqueued, stats.failed_exhausted);
//!
//!     for job in admin.list_jobs(JobState::FailedExhausted, 20, 0).await? {
//!         admin.requeue(&job.id).await?;
//!     }
//!
//!     Ok(())
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use backlog_core::{Backend, Client, SharedBackend};

pub use backlog_core::{BacklogError, Job, JobId, JobState, RecurringJob, Result, StateRecord};

/// Job counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Jobs waiting for their due time (including retries).
    pub scheduled: usize,
    /// Jobs ready to be claimed.
    pub enqueued: usize,
    /// Jobs held by a worker.
    pub processing: usize,
    /// Jobs that completed successfully.
    pub succeeded: usize,
    /// Jobs whose last attempt failed and await a retry decision.
    pub failed: usize,
    /// Jobs that ran out of retries.
    pub failed_exhausted: usize,
    /// Continuations waiting on their parent.
    pub awaiting_continuation: usize,
    /// Cancelled jobs.
    pub deleted: usize,
    /// Recurring definitions.
    pub recurring: usize,
}

impl QueueStats {
    /// Count for one state.
    pub fn get(&self, state: JobState) -> usize {
        match state {
            JobState::Scheduled => self.scheduled,
            JobState::Enqueued => self.enqueued,
            JobState::Processing => self.processing,
            JobState::Succeeded => self.succeeded,
            JobState::Failed => self.failed,
            JobState::FailedExhausted => self.failed_exhausted,
            JobState::AwaitingContinuation => self.awaiting_continuation,
            JobState::Deleted => self.deleted,
        }
    }

    /// Jobs across all states.
    pub fn total_jobs(&self) -> usize {
        JobState::ALL.iter().map(|state| self.get(*state)).sum()
    }
}

/// Dashboard row for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    /// Job ID.
    pub id: String,
    /// Handler name.
    pub handler: String,
    /// Handler arguments.
    pub args: serde_json::Value,
    /// Queue the job belongs to.
    pub queue: String,
    /// Current state.
    pub state: JobState,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the job is due, if scheduled.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Last error message.
    pub last_error: Option<String>,
    /// Recurring definition that spawned the job.
    pub recurring: Option<String>,
    /// Parent job, for continuations.
    pub parent_id: Option<String>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.to_string(),
            handler: job.invocation.handler.clone(),
            args: job.invocation.args.clone(),
            queue: job.queue.clone(),
            state: job.state,
            created_at: job.created_at,
            scheduled_at: job.scheduled_at,
            retry_count: job.retry_count,
            last_error: job.last_error.clone(),
            recurring: job.recurring.clone(),
            parent_id: job.parent_id.as_ref().map(|id| id.to_string()),
        }
    }
}

/// Admin client for inspecting and managing jobs.
///
/// Job ids are taken as strings, the way a dashboard receives them.
/// A malformed id is reported as `JobNotFound`.
#[derive(Clone)]
pub struct AdminClient<B: Backend + Clone = SharedBackend> {
    backend: B,
    client: Client<B>,
}

impl AdminClient<SharedBackend> {
    /// Create a new admin client with a shared backend.
    pub fn new(backend: impl Backend + 'static) -> Self {
        Self::with_backend(SharedBackend::new(backend))
    }
}

impl<B: Backend + Clone> AdminClient<B> {
    /// Create a new admin client with a specific backend.
    pub fn with_backend(backend: B) -> Self {
        Self {
            client: Client::with_backend(backend.clone()),
            backend,
        }
    }

    /// Get a reference to the underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    // ========== Statistics ==========

    /// Get job counts for every state.
    pub async fn stats(&self) -> Result<QueueStats> {
        let b = &self.backend;
        let (
            scheduled,
            enqueued,
            processing,
            succeeded,
            failed,
            failed_exhausted,
            awaiting_continuation,
            deleted,
            recurring,
        ) = tokio::try_join!(
            b.count_jobs(JobState::Scheduled),
            b.count_jobs(JobState::Enqueued),
            b.count_jobs(JobState::Processing),
            b.count_jobs(JobState::Succeeded),
            b.count_jobs(JobState::Failed),
            b.count_jobs(JobState::FailedExhausted),
            b.count_jobs(JobState::AwaitingContinuation),
            b.count_jobs(JobState::Deleted),
            async { b.list_recurring().await.map(|defs| defs.len()) },
        )?;

        Ok(QueueStats {
            scheduled,
            enqueued,
            processing,
            succeeded,
            failed,
            failed_exhausted,
            awaiting_continuation,
            deleted,
            recurring,
        })
    }

    /// Get the number of jobs in one state.
    pub async fn count(&self, state: JobState) -> Result<usize> {
        self.backend.count_jobs(state).await
    }

    // ========== Jobs ==========

    /// List jobs in `state` with pagination, oldest first.
    pub async fn list_jobs(
        &self,
        state: JobState,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobSummary>> {
        let jobs = self.backend.list_jobs(state, limit, offset).await?;
        Ok(jobs.iter().map(JobSummary::from).collect())
    }

    /// Get a job by its ID.
    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let id = match JobId::from_str(job_id) {
            Ok(id) => id,
            Err(_) => return Ok(None),
        };
        match self.backend.fetch(&id).await {
            Ok(job) => Ok(Some(job)),
            Err(BacklogError::JobNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Every state a job went through, oldest first.
    pub async fn history(&self, job_id: &str) -> Result<Vec<StateRecord>> {
        let id = JobId::from_str(job_id)?;
        Ok(self.backend.fetch(&id).await?.history)
    }

    /// Continuations created for a job.
    pub async fn continuations(&self, job_id: &str) -> Result<Vec<JobSummary>> {
        let id = JobId::from_str(job_id)?;
        let mut children = Vec::new();
        for child in self.backend.continuations(&id).await? {
            children.push(JobSummary::from(&self.backend.fetch(&child).await?));
        }
        Ok(children)
    }

    /// Put a scheduled or failed job back on its queue.
    ///
    /// The retry count is reset to 0.
    pub async fn requeue(&self, job_id: &str) -> Result<Job> {
        let job = self.client.requeue(&JobId::from_str(job_id)?).await?;
        tracing::info!(job_id = %job.id, queue = %job.queue, "Job requeued");
        Ok(job)
    }

    /// Delete a job that has not finished.
    pub async fn delete(&self, job_id: &str) -> Result<Job> {
        let job = self.client.delete(&JobId::from_str(job_id)?).await?;
        tracing::info!(job_id = %job.id, "Job deleted");
        Ok(job)
    }

    // ========== Recurring Jobs ==========

    /// List all recurring definitions, by name.
    pub async fn list_recurring(&self) -> Result<Vec<RecurringJob>> {
        self.backend.list_recurring().await
    }

    /// Spawn a job from a recurring definition now.
    pub async fn trigger_recurring(&self, name: &str) -> Result<JobId> {
        let id = self.client.trigger_recurring(name).await?;
        tracing::info!(recurring = %name, job_id = %id, "Recurring job triggered");
        Ok(id)
    }

    /// Remove a recurring definition. Returns whether it existed.
    pub async fn remove_recurring(&self, name: &str) -> Result<bool> {
        self.client.remove_recurring(name).await
    }
}
