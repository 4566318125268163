//! Store abstraction for job persistence.
//!
//! Every component (client, scheduler, reaper, workers) talks to the others
//! only through this trait. Implementations must make each method atomic with
//! respect to concurrent callers in any process sharing the store; no other
//! synchronization is assumed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::job::{Job, JobId, JobState};
use crate::recurring::RecurringJob;
use crate::state::{Expected, StateChange};

/// Backend trait for job storage operations.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Backend: Send + Sync {
    // ========== Job Records ==========

    /// Persist a new job in whatever initial state it carries.
    ///
    /// Fails with `DuplicateJob` if the id already exists.
    async fn create(&self, job: &Job) -> Result<()>;

    /// Load a job. Fails with `JobNotFound`.
    async fn fetch(&self, id: &JobId) -> Result<Job>;

    /// Atomically move the oldest `Enqueued` job of the first non-empty queue
    /// in `queues` to `Processing`, leased to `owner` for `lease`.
    ///
    /// At most one caller ever receives a given claim.
    async fn try_claim(
        &self,
        queues: &[String],
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<Job>>;

    /// Apply `change` if the stored record meets `expected`.
    ///
    /// Fails with `Conflict` when it does not. Returns the updated record.
    async fn update_state(
        &self,
        id: &JobId,
        expected: &Expected,
        change: &StateChange,
    ) -> Result<Job>;

    /// Push the lease expiry of a `Processing` job held by `owner`.
    ///
    /// Fails with `Conflict` if the job is no longer processing under `owner`.
    async fn extend_lease(&self, id: &JobId, owner: &str, until: DateTime<Utc>) -> Result<()>;

    // ========== Schedule ==========

    /// Ids of `Scheduled` jobs due at or before `before`, earliest first.
    async fn list_due(&self, before: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>>;

    /// Ids of `Processing` jobs whose lease lapsed at or before `now`.
    async fn list_expired_leases(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>>;

    // ========== Continuations ==========

    /// Ids of jobs created as continuations of `parent`.
    async fn continuations(&self, parent: &JobId) -> Result<Vec<JobId>>;

    // ========== Recurring Definitions ==========

    /// Insert or replace a recurring definition by name.
    async fn upsert_recurring(&self, definition: &RecurringJob) -> Result<()>;

    /// Load a recurring definition.
    async fn get_recurring(&self, name: &str) -> Result<Option<RecurringJob>>;

    /// Remove a recurring definition. Returns whether it existed.
    async fn remove_recurring(&self, name: &str) -> Result<bool>;

    /// All recurring definitions, by name.
    async fn list_recurring(&self) -> Result<Vec<RecurringJob>>;

    /// Definitions whose next occurrence is at or before `now`.
    async fn list_due_recurring(&self, now: DateTime<Utc>, limit: usize)
        -> Result<Vec<RecurringJob>>;

    /// Move a definition's next occurrence from `expected_due` to `next_due`,
    /// recording `job_id` as the job it spawned.
    ///
    /// Fails with `Conflict` if the stored next occurrence is not
    /// `expected_due` (another scheduler got there first).
    async fn advance_recurring(
        &self,
        name: &str,
        expected_due: DateTime<Utc>,
        next_due: Option<DateTime<Utc>>,
        job_id: &JobId,
    ) -> Result<()>;

    // ========== Inspection ==========

    /// Jobs in `state`, oldest first, with pagination.
    async fn list_jobs(&self, state: JobState, limit: usize, offset: usize) -> Result<Vec<Job>>;

    /// Number of jobs in `state`.
    async fn count_jobs(&self, state: JobState) -> Result<usize>;
}

/// A type-erased backend that can be shared across threads.
pub type DynBackend = Arc<dyn Backend>;

/// Wrapper around Arc<dyn Backend> for convenience.
#[derive(Clone)]
pub struct SharedBackend {
    inner: DynBackend,
}

impl SharedBackend {
    /// Create a new SharedBackend from any Backend implementation.
    pub fn new<B: Backend + 'static>(backend: B) -> Self {
        Self {
            inner: Arc::new(backend),
        }
    }

    /// Get a reference to the inner backend.
    pub fn inner(&self) -> &DynBackend {
        &self.inner
    }
}

#[async_trait]
impl Backend for SharedBackend {
    async fn create(&self, job: &Job) -> Result<()> {
        self.inner.create(job).await
    }

    async fn fetch(&self, id: &JobId) -> Result<Job> {
        self.inner.fetch(id).await
    }

    async fn try_claim(
        &self,
        queues: &[String],
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<Job>> {
        self.inner.try_claim(queues, owner, now, lease).await
    }

    async fn update_state(
        &self,
        id: &JobId,
        expected: &Expected,
        change: &StateChange,
    ) -> Result<Job> {
        self.inner.update_state(id, expected, change).await
    }

    async fn extend_lease(&self, id: &JobId, owner: &str, until: DateTime<Utc>) -> Result<()> {
        self.inner.extend_lease(id, owner, until).await
    }

    async fn list_due(&self, before: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>> {
        self.inner.list_due(before, limit).await
    }

    async fn list_expired_leases(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>> {
        self.inner.list_expired_leases(now, limit).await
    }

    async fn continuations(&self, parent: &JobId) -> Result<Vec<JobId>> {
        self.inner.continuations(parent).await
    }

    async fn upsert_recurring(&self, definition: &RecurringJob) -> Result<()> {
        self.inner.upsert_recurring(definition).await
    }

    async fn get_recurring(&self, name: &str) -> Result<Option<RecurringJob>> {
        self.inner.get_recurring(name).await
    }

    async fn remove_recurring(&self, name: &str) -> Result<bool> {
        self.inner.remove_recurring(name).await
    }

    async fn list_recurring(&self) -> Result<Vec<RecurringJob>> {
        self.inner.list_recurring().await
    }

    async fn list_due_recurring(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RecurringJob>> {
        self.inner.list_due_recurring(now, limit).await
    }

    async fn advance_recurring(
        &self,
        name: &str,
        expected_due: DateTime<Utc>,
        next_due: Option<DateTime<Utc>>,
        job_id: &JobId,
    ) -> Result<()> {
        self.inner
            .advance_recurring(name, expected_due, next_due, job_id)
            .await
    }

    async fn list_jobs(&self, state: JobState, limit: usize, offset: usize) -> Result<Vec<Job>> {
        self.inner.list_jobs(state, limit, offset).await
    }

    async fn count_jobs(&self, state: JobState) -> Result<usize> {
        self.inner.count_jobs(state).await
    }
}

/// Lease expiry for a claim made at `now`.
pub fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(365))
}
