//! Store wrapper that fails chosen operations with `StorageUnavailable`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::Backend;
use crate::error::{BacklogError, Result};
use crate::job::{Job, JobId, JobState};
use crate::memory::InMemoryBackend;
use crate::recurring::RecurringJob;
use crate::state::{Expected, StateChange};

/// Delegates to an [`InMemoryBackend`] except for armed operations, which
/// fail before touching the store until their count runs out.
#[derive(Clone, Default)]
pub(crate) struct FlakyBackend {
    inner: InMemoryBackend,
    outages: Arc<Mutex<HashMap<&'static str, usize>>>,
}

impl FlakyBackend {
    pub(crate) fn new(inner: InMemoryBackend) -> Self {
        Self {
            inner,
            outages: Arc::default(),
        }
    }

    /// Make the next `times` calls of `operation` fail.
    pub(crate) fn fail_next(&self, operation: &'static str, times: usize) {
        self.outages.lock().unwrap().insert(operation, times);
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        let mut outages = self.outages.lock().unwrap();
        match outages.get_mut(operation) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(BacklogError::StorageUnavailable(format!("{} timed out", operation)))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Backend for FlakyBackend {
    async fn create(&self, job: &Job) -> Result<()> {
        self.check("create")?;
        self.inner.create(job).await
    }

    async fn fetch(&self, id: &JobId) -> Result<Job> {
        self.check("fetch")?;
        self.inner.fetch(id).await
    }

    async fn try_claim(
        &self,
        queues: &[String],
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<Job>> {
        self.check("try_claim")?;
        self.inner.try_claim(queues, owner, now, lease).await
    }

    async fn update_state(
        &self,
        id: &JobId,
        expected: &Expected,
        change: &StateChange,
    ) -> Result<Job> {
        self.check("update_state")?;
        self.inner.update_state(id, expected, change).await
    }

    async fn extend_lease(&self, id: &JobId, owner: &str, until: DateTime<Utc>) -> Result<()> {
        self.check("extend_lease")?;
        self.inner.extend_lease(id, owner, until).await
    }

    async fn list_due(&self, before: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>> {
        self.check("list_due")?;
        self.inner.list_due(before, limit).await
    }

    async fn list_expired_leases(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>> {
        self.check("list_expired_leases")?;
        self.inner.list_expired_leases(now, limit).await
    }

    async fn continuations(&self, parent: &JobId) -> Result<Vec<JobId>> {
        self.check("continuations")?;
        self.inner.continuations(parent).await
    }

    async fn upsert_recurring(&self, definition: &RecurringJob) -> Result<()> {
        self.check("upsert_recurring")?;
        self.inner.upsert_recurring(definition).await
    }

    async fn get_recurring(&self, name: &str) -> Result<Option<RecurringJob>> {
        self.check("get_recurring")?;
        self.inner.get_recurring(name).await
    }

    async fn remove_recurring(&self, name: &str) -> Result<bool> {
        self.check("remove_recurring")?;
        self.inner.remove_recurring(name).await
    }

    async fn list_recurring(&self) -> Result<Vec<RecurringJob>> {
        self.check("list_recurring")?;
        self.inner.list_recurring().await
    }

    async fn list_due_recurring(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RecurringJob>> {
        self.check("list_due_recurring")?;
        self.inner.list_due_recurring(now, limit).await
    }

    async fn advance_recurring(
        &self,
        name: &str,
        expected_due: DateTime<Utc>,
        next_due: Option<DateTime<Utc>>,
        job_id: &JobId,
    ) -> Result<()> {
        self.check("advance_recurring")?;
        self.inner
            .advance_recurring(name, expected_due, next_due, job_id)
            .await
    }

    async fn list_jobs(&self, state: JobState, limit: usize, offset: usize) -> Result<Vec<Job>> {
        self.check("list_jobs")?;
        self.inner.list_jobs(state, limit, offset).await
    }

    async fn count_jobs(&self, state: JobState) -> Result<usize> {
        self.check("count_jobs")?;
        self.inner.count_jobs(state).await
    }
}
