//! In-memory store.
//!
//! Keeps every record in one mutex-guarded map with secondary indexes for the
//! ready queues, the schedule and live leases. Clones share the same data, so
//! a client, a worker pool and an admin client can all point at one instance.
//! Nothing survives the process; use it for tests and single-process demos.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::backend::{lease_deadline, Backend};
use crate::error::{BacklogError, Result};
use crate::job::{Job, JobId, JobState};
use crate::recurring::RecurringJob;
use crate::state::{Expected, JobEvent, StateChange};

/// Position in a ready queue: enqueue time, then insertion order.
type ReadyKey = (DateTime<Utc>, u64, JobId);

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    ready: HashMap<String, BTreeSet<ReadyKey>>,
    ready_index: HashMap<JobId, (String, ReadyKey)>,
    schedule: BTreeSet<(DateTime<Utc>, JobId)>,
    leases: BTreeSet<(DateTime<Utc>, JobId)>,
    children: HashMap<JobId, Vec<JobId>>,
    recurring: BTreeMap<String, RecurringJob>,
    seq: u64,
}

impl Inner {
    fn index(&mut self, job: &Job) {
        match job.state {
            JobState::Enqueued => {
                self.seq += 1;
                let key = (
                    job.enqueued_at.unwrap_or(job.created_at),
                    self.seq,
                    job.id.clone(),
                );
                self.ready
                    .entry(job.queue.clone())
                    .or_default()
                    .insert(key.clone());
                self.ready_index
                    .insert(job.id.clone(), (job.queue.clone(), key));
            }
            JobState::Scheduled => {
                let due = job.scheduled_at.unwrap_or(job.created_at);
                self.schedule.insert((due, job.id.clone()));
            }
            JobState::Processing => {
                if let Some(lease) = &job.lease {
                    self.leases.insert((lease.expires_at, job.id.clone()));
                }
            }
            _ => {}
        }
    }

    fn unindex(&mut self, job: &Job) {
        match job.state {
            JobState::Enqueued => {
                if let Some((queue, key)) = self.ready_index.remove(&job.id) {
                    if let Some(set) = self.ready.get_mut(&queue) {
                        set.remove(&key);
                    }
                }
            }
            JobState::Scheduled => {
                let due = job.scheduled_at.unwrap_or(job.created_at);
                self.schedule.remove(&(due, job.id.clone()));
            }
            JobState::Processing => {
                if let Some(lease) = &job.lease {
                    self.leases.remove(&(lease.expires_at, job.id.clone()));
                }
            }
            _ => {}
        }
    }

    /// Replace a record, keeping the indexes in step.
    fn store(&mut self, job: Job) {
        if let Some(old) = self.jobs.remove(&job.id) {
            self.unindex(&old);
        }
        self.index(&job);
        self.jobs.insert(job.id.clone(), job);
    }

    fn get(&self, id: &JobId) -> Result<&Job> {
        self.jobs
            .get(id)
            .ok_or_else(|| BacklogError::JobNotFound(id.to_string()))
    }

    fn oldest_ready(&self, queue: &str) -> Option<JobId> {
        self.ready
            .get(queue)
            .and_then(|set| set.first())
            .map(|(_, _, id)| id.clone())
    }
}

/// In-memory store shared by clones.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryBackend {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| BacklogError::Backend("in-memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn create(&self, job: &Job) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.jobs.contains_key(&job.id) {
            return Err(BacklogError::DuplicateJob(job.id.to_string()));
        }
        if let Some(parent) = &job.parent_id {
            inner
                .children
                .entry(parent.clone())
                .or_default()
                .push(job.id.clone());
        }
        inner.store(job.clone());
        Ok(())
    }

    async fn fetch(&self, id: &JobId) -> Result<Job> {
        self.lock()?.get(id).cloned()
    }

    async fn try_claim(
        &self,
        queues: &[String],
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<Job>> {
        let mut inner = self.lock()?;
        let Some(id) = queues.iter().find_map(|queue| inner.oldest_ready(queue)) else {
            return Ok(None);
        };

        let mut job = inner.get(&id)?.clone();
        let change = StateChange::new(
            JobState::Enqueued,
            &JobEvent::Claim {
                owner: owner.to_string(),
                lease_until: lease_deadline(now, lease),
            },
            now,
        )?;
        change.apply(&mut job);
        inner.store(job.clone());
        Ok(Some(job))
    }

    async fn update_state(
        &self,
        id: &JobId,
        expected: &Expected,
        change: &StateChange,
    ) -> Result<Job> {
        let mut inner = self.lock()?;
        let mut job = inner.get(id)?.clone();
        expected.check(&job)?;
        if change.transition.from != job.state {
            return Err(BacklogError::InvalidTransition {
                from: job.state,
                event: format!("change computed for {}", change.transition.from),
            });
        }
        change.apply(&mut job);
        inner.store(job.clone());
        Ok(job)
    }

    async fn extend_lease(&self, id: &JobId, owner: &str, until: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock()?;
        let mut job = inner.get(id)?.clone();
        Expected::state(JobState::Processing)
            .owned_by(owner)
            .check(&job)?;
        if let Some(lease) = job.lease.as_mut() {
            lease.expires_at = until;
        }
        inner.store(job);
        Ok(())
    }

    async fn list_due(&self, before: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>> {
        let inner = self.lock()?;
        Ok(inner
            .schedule
            .iter()
            .take_while(|(due, _)| *due <= before)
            .take(limit)
            .map(|(_, id)| id.clone())
            .collect())
    }

    async fn list_expired_leases(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>> {
        let inner = self.lock()?;
        Ok(inner
            .leases
            .iter()
            .take_while(|(expires_at, _)| *expires_at <= now)
            .take(limit)
            .map(|(_, id)| id.clone())
            .collect())
    }

    async fn continuations(&self, parent: &JobId) -> Result<Vec<JobId>> {
        Ok(self
            .lock()?
            .children
            .get(parent)
            .cloned()
            .unwrap_or_default())
    }

    async fn upsert_recurring(&self, definition: &RecurringJob) -> Result<()> {
        self.lock()?
            .recurring
            .insert(definition.name.clone(), definition.clone());
        Ok(())
    }

    async fn get_recurring(&self, name: &str) -> Result<Option<RecurringJob>> {
        Ok(self.lock()?.recurring.get(name).cloned())
    }

    async fn remove_recurring(&self, name: &str) -> Result<bool> {
        Ok(self.lock()?.recurring.remove(name).is_some())
    }

    async fn list_recurring(&self) -> Result<Vec<RecurringJob>> {
        Ok(self.lock()?.recurring.values().cloned().collect())
    }

    async fn list_due_recurring(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RecurringJob>> {
        Ok(self
            .lock()?
            .recurring
            .values()
            .filter(|definition| definition.is_due(now))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn advance_recurring(
        &self,
        name: &str,
        expected_due: DateTime<Utc>,
        next_due: Option<DateTime<Utc>>,
        job_id: &JobId,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let definition = inner
            .recurring
            .get_mut(name)
            .ok_or_else(|| BacklogError::Conflict(format!("recurring job {} was removed", name)))?;
        if definition.next_due != Some(expected_due) {
            return Err(BacklogError::Conflict(format!(
                "recurring job {} already advanced past {}",
                name, expected_due
            )));
        }
        definition.next_due = next_due;
        definition.last_fired_at = Some(expected_due);
        definition.last_job_id = Some(job_id.clone());
        Ok(())
    }

    async fn list_jobs(&self, state: JobState, limit: usize, offset: usize) -> Result<Vec<Job>> {
        let inner = self.lock()?;
        let mut jobs: Vec<&Job> = inner.jobs.values().filter(|j| j.state == state).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs.into_iter().skip(offset).take(limit).cloned().collect())
    }

    async fn count_jobs(&self, state: JobState) -> Result<usize> {
        Ok(self
            .lock()?
            .jobs
            .values()
            .filter(|j| j.state == state)
            .count())
    }
}
