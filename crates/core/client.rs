//! Client for submitting jobs.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{Backend, SharedBackend};
use crate::continuation;
use crate::error::{BacklogError, Result};
use crate::job::{ContinuationCondition, Invocation, Job, JobId, JobOptions};
use crate::lifecycle::Lifecycle;
use crate::recurring::{parse_timezone, BuiltinSchedules, RecurringJob, ScheduleEvaluator};

/// Client for submitting jobs to the store.
#[derive(Clone)]
pub struct Client<B: Backend + Clone = SharedBackend> {
    lifecycle: Lifecycle<B>,
    evaluator: Arc<dyn ScheduleEvaluator>,
}

impl Client<SharedBackend> {
    /// Create a new client with a shared backend.
    pub fn new(backend: impl Backend + 'static) -> Self {
        Self::with_backend(SharedBackend::new(backend))
    }
}

impl<B: Backend + Clone> Client<B> {
    /// Create a new client with a specific backend.
    pub fn with_backend(backend: B) -> Self {
        Self {
            lifecycle: Lifecycle::new(backend),
            evaluator: Arc::new(BuiltinSchedules),
        }
    }

    /// Use another schedule evaluator for recurring definitions.
    ///
    /// Must agree with the evaluator the worker pools use.
    pub fn with_evaluator(mut self, evaluator: impl ScheduleEvaluator + 'static) -> Self {
        self.evaluator = Arc::new(evaluator);
        self
    }

    fn backend(&self) -> &B {
        self.lifecycle.backend()
    }

    /// Enqueue a job for immediate processing.
    pub async fn enqueue(&self, invocation: Invocation) -> Result<JobId> {
        self.enqueue_with_options(invocation, JobOptions::default())
            .await
    }

    /// Enqueue a job with custom options.
    pub async fn enqueue_with_options(
        &self,
        invocation: Invocation,
        options: JobOptions,
    ) -> Result<JobId> {
        let job = Job::enqueued(invocation, options, Utc::now());
        self.backend().create(&job).await?;

        tracing::debug!(job_id = %job.id, queue = %job.queue, "Job enqueued");
        Ok(job.id)
    }

    /// Schedule a job to run after a delay.
    pub async fn schedule(&self, invocation: Invocation, delay: Duration) -> Result<JobId> {
        self.schedule_with_options(invocation, delay, JobOptions::default())
            .await
    }

    /// Schedule a job with custom options.
    pub async fn schedule_with_options(
        &self,
        invocation: Invocation,
        delay: Duration,
        options: JobOptions,
    ) -> Result<JobId> {
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| BacklogError::Config(format!("delay out of range: {}", e)))?;
        self.schedule_at_with_options(invocation, Utc::now() + delay, options)
            .await
    }

    /// Schedule a job to run at a specific time.
    pub async fn schedule_at(&self, invocation: Invocation, run_at: DateTime<Utc>) -> Result<JobId> {
        self.schedule_at_with_options(invocation, run_at, JobOptions::default())
            .await
    }

    /// Schedule a job to run at a specific time with custom options.
    pub async fn schedule_at_with_options(
        &self,
        invocation: Invocation,
        run_at: DateTime<Utc>,
        options: JobOptions,
    ) -> Result<JobId> {
        let job = Job::scheduled(invocation, options, run_at, Utc::now());
        self.backend().create(&job).await?;

        tracing::debug!(job_id = %job.id, run_at = %run_at, "Job scheduled");
        Ok(job.id)
    }

    /// Run a job after `parent` finishes, if `condition` holds.
    ///
    /// Fails with `JobNotFound` if the parent does not exist. A parent that
    /// already finished settles the continuation right away.
    pub async fn continue_with(
        &self,
        parent: &JobId,
        invocation: Invocation,
        condition: ContinuationCondition,
    ) -> Result<JobId> {
        self.continue_with_options(parent, invocation, condition, JobOptions::default())
            .await
    }

    /// Continuation with custom options.
    pub async fn continue_with_options(
        &self,
        parent: &JobId,
        invocation: Invocation,
        condition: ContinuationCondition,
        options: JobOptions,
    ) -> Result<JobId> {
        self.backend().fetch(parent).await?;

        let job = Job::awaiting(invocation, options, parent.clone(), condition, Utc::now());
        self.backend().create(&job).await?;
        tracing::debug!(job_id = %job.id, parent_id = %parent, "Continuation created");

        // The parent may have finished before the link existed.
        let parent_job = self.backend().fetch(parent).await?;
        if parent_job.state.is_finished() {
            continuation::settle(self.backend(), parent, parent_job.state, Utc::now()).await?;
        }
        Ok(job.id)
    }

    /// Create or replace a recurring definition.
    ///
    /// `schedule` is an expression for the schedule evaluator and `timezone`
    /// an IANA name. Both are validated here.
    pub async fn add_or_update_recurring(
        &self,
        name: &str,
        invocation: Invocation,
        schedule: &str,
        timezone: &str,
    ) -> Result<()> {
        self.add_or_update_recurring_with_options(
            name,
            invocation,
            schedule,
            timezone,
            JobOptions::default(),
        )
        .await
    }

    /// Recurring definition with custom options for the spawned jobs.
    pub async fn add_or_update_recurring_with_options(
        &self,
        name: &str,
        invocation: Invocation,
        schedule: &str,
        timezone: &str,
        options: JobOptions,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(BacklogError::Config(
                "recurring job name must not be empty".to_string(),
            ));
        }
        let tz = parse_timezone(timezone)?;
        let now = Utc::now();
        let existing = self.backend().get_recurring(name).await?;

        // Keep the pending occurrence when only the payload changes.
        let next_due = match &existing {
            Some(old) if old.schedule == schedule && old.timezone == timezone => old.next_due,
            _ => self.evaluator.next_occurrence(schedule, tz, now)?,
        };

        let definition = RecurringJob {
            name: name.to_string(),
            invocation,
            schedule: schedule.to_string(),
            timezone: timezone.to_string(),
            queue: options.queue,
            retry: options.retry,
            next_due,
            last_fired_at: existing.as_ref().and_then(|old| old.last_fired_at),
            last_job_id: existing.as_ref().and_then(|old| old.last_job_id.clone()),
            created_at: existing.as_ref().map(|old| old.created_at).unwrap_or(now),
            updated_at: now,
        };
        self.backend().upsert_recurring(&definition).await?;

        tracing::debug!(
            recurring = %name,
            schedule = %schedule,
            timezone = %timezone,
            next_due = ?next_due,
            "Recurring job saved"
        );
        Ok(())
    }

    /// Remove a recurring definition. Jobs it already spawned are untouched.
    pub async fn remove_recurring(&self, name: &str) -> Result<bool> {
        let removed = self.backend().remove_recurring(name).await?;
        if removed {
            tracing::debug!(recurring = %name, "Recurring job removed");
        }
        Ok(removed)
    }

    /// Spawn a job from a recurring definition now, outside its schedule.
    pub async fn trigger_recurring(&self, name: &str) -> Result<JobId> {
        let definition = self
            .backend()
            .get_recurring(name)
            .await?
            .ok_or_else(|| BacklogError::JobNotFound(format!("recurring job {}", name)))?;

        let mut job = Job::enqueued(
            definition.invocation,
            JobOptions {
                queue: definition.queue,
                retry: definition.retry,
            },
            Utc::now(),
        );
        job.recurring = Some(definition.name);
        self.backend().create(&job).await?;

        tracing::debug!(recurring = %name, job_id = %job.id, "Recurring job triggered");
        Ok(job.id)
    }

    /// Cancel a job in any non-terminal state.
    pub async fn delete(&self, id: &JobId) -> Result<Job> {
        self.lifecycle.delete(id, Utc::now()).await
    }

    /// Put a scheduled or failed job back on its queue.
    pub async fn requeue(&self, id: &JobId) -> Result<Job> {
        self.lifecycle.requeue(id, Utc::now()).await
    }

    /// Load a job.
    pub async fn fetch(&self, id: &JobId) -> Result<Job> {
        self.backend().fetch(id).await
    }
}
