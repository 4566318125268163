//! Scheduler: promotes due jobs and fires recurring definitions.
//!
//! Every tick is safe to run concurrently with other ticks, in this process
//! or another. Promotion is a CAS from `Scheduled`, so a job promoted by one
//! tick is a conflict for the next. Recurring occurrences get deterministic
//! ids and the definition is advanced with a CAS on its next due time, so
//! each occurrence spawns exactly one job.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

use crate::backend::Backend;
use crate::error::{BacklogError, Result};
use crate::job::{Job, JobId, JobOptions, JobState};
use crate::lifecycle::Lifecycle;
use crate::recurring::{RecurringJob, ScheduleEvaluator};
use crate::state::{Expected, JobEvent};

/// What one scheduler tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Scheduled jobs moved to their queue.
    pub promoted: usize,
    /// Jobs spawned by recurring definitions.
    pub recurring_created: usize,
}

/// Scheduler that moves scheduled jobs to their queue when their time comes.
pub struct Scheduler<B: Backend> {
    lifecycle: Lifecycle<B>,
    evaluator: Arc<dyn ScheduleEvaluator>,
    interval: Duration,
    batch_size: usize,
    running: Arc<AtomicBool>,
}

impl<B: Backend> Scheduler<B> {
    /// Create a new Scheduler.
    pub fn new(
        backend: B,
        evaluator: Arc<dyn ScheduleEvaluator>,
        interval: Duration,
        batch_size: usize,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            lifecycle: Lifecycle::new(backend),
            evaluator,
            interval,
            batch_size,
            running,
        }
    }

    /// Run the scheduler loop.
    pub async fn run(&self) -> Result<()> {
        tracing::info!(interval = ?self.interval, "Scheduler started");

        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.tick().await {
                if e.is_transient() {
                    tracing::warn!(error = %e, "Store unavailable, scheduler will retry");
                } else {
                    tracing::error!(error = %e, "Scheduler tick failed");
                }
            }

            time::sleep(self.interval).await;
        }

        tracing::info!("Scheduler stopped");
        Ok(())
    }

    /// Process one tick now.
    pub async fn tick(&self) -> Result<TickReport> {
        self.tick_at(Utc::now()).await
    }

    /// Process one tick as of `now`.
    ///
    /// Missed ticks are caught up: everything due at or before `now` fires,
    /// up to the batch size per tick.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let report = TickReport {
            promoted: self.promote_due(now).await?,
            recurring_created: self.fire_recurring(now).await?,
        };
        if report != TickReport::default() {
            tracing::debug!(
                promoted = report.promoted,
                recurring_created = report.recurring_created,
                "Scheduler tick"
            );
        }
        Ok(report)
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self
            .lifecycle
            .backend()
            .list_due(now, self.batch_size)
            .await?;

        let mut promoted = 0;
        for id in due {
            match self
                .lifecycle
                .apply(&id, &Expected::state(JobState::Scheduled), &JobEvent::Promote, now)
                .await
            {
                Ok(_) => promoted += 1,
                Err(e) if e.is_conflict() => {
                    tracing::debug!(job_id = %id, "Already promoted");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(promoted)
    }

    async fn fire_recurring(&self, now: DateTime<Utc>) -> Result<usize> {
        let definitions = self
            .lifecycle
            .backend()
            .list_due_recurring(now, self.batch_size)
            .await?;

        let mut created = 0;
        for definition in definitions {
            if created >= self.batch_size {
                break;
            }
            match self
                .fire_definition(&definition, now, self.batch_size - created)
                .await
            {
                Ok(n) => created += n,
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    tracing::error!(
                        recurring = %definition.name,
                        error = %e,
                        "Failed to fire recurring job"
                    );
                }
            }
        }
        Ok(created)
    }

    /// Spawn one job per past-due occurrence of `definition`.
    async fn fire_definition(
        &self,
        definition: &RecurringJob,
        now: DateTime<Utc>,
        budget: usize,
    ) -> Result<usize> {
        let backend = self.lifecycle.backend();
        let timezone = definition.tz()?;
        let mut created = 0;
        let mut due = definition.next_due;

        while let Some(at) = due {
            if at > now || created >= budget {
                break;
            }

            let mut job = Job::enqueued(
                definition.invocation.clone(),
                JobOptions {
                    queue: definition.queue.clone(),
                    retry: definition.retry.clone(),
                },
                now,
            )
            .with_id(JobId::for_occurrence(&definition.name, at));
            job.recurring = Some(definition.name.clone());

            match backend.create(&job).await {
                Ok(()) => {
                    created += 1;
                    tracing::debug!(
                        recurring = %definition.name,
                        job_id = %job.id,
                        occurrence = %at,
                        "Recurring job fired"
                    );
                }
                Err(BacklogError::DuplicateJob(_)) => {
                    tracing::debug!(
                        recurring = %definition.name,
                        occurrence = %at,
                        "Occurrence already fired"
                    );
                }
                Err(e) => return Err(e),
            }

            let next = self
                .evaluator
                .next_occurrence(&definition.schedule, timezone, at)?;
            if next.is_some_and(|n| n <= at) {
                return Err(BacklogError::Schedule(format!(
                    "schedule {:?} of {} did not move past {}",
                    definition.schedule, definition.name, at
                )));
            }
            match backend
                .advance_recurring(&definition.name, at, next, &job.id)
                .await
            {
                Ok(()) => due = next,
                Err(e) if e.is_conflict() => {
                    tracing::debug!(recurring = %definition.name, "Advanced by another scheduler");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(created)
    }
}
