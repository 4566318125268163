//! Drives jobs through the state machine against a store.
//!
//! Every component that changes a job's state (client, scheduler, reaper,
//! workers) goes through [`Lifecycle`], so continuations and the retry
//! policy are applied the same way no matter who made the move.

use chrono::{DateTime, Utc};

use crate::backend::Backend;
use crate::continuation;
use crate::error::{BacklogError, Result};
use crate::job::{Job, JobId, JobState};
use crate::retrier::{RetryDecision, RetryPolicy};
use crate::state::{Expected, JobEvent, StateChange};

/// Attempts for operations that re-read the record after a `Conflict`.
const MAX_CONFLICT_ATTEMPTS: usize = 5;

/// State-machine driver over a store.
#[derive(Clone)]
pub struct Lifecycle<B> {
    backend: B,
}

impl<B: Backend> Lifecycle<B> {
    /// Create a new lifecycle driver.
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Get a reference to the store.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Apply `event` to a job that must currently meet `expected`.
    ///
    /// Settles continuations when the move finishes the job.
    pub async fn apply(
        &self,
        id: &JobId,
        expected: &Expected,
        event: &JobEvent,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let change = StateChange::new(expected.state, event, now)?;
        let job = self.backend.update_state(id, expected, &change).await?;

        tracing::debug!(
            job_id = %id,
            from = %change.transition.from,
            to = %job.state,
            event = event.name(),
            "Job transitioned"
        );

        if change.fires_continuations() {
            continuation::settle(&self.backend, id, job.state, now).await?;
        }
        Ok(job)
    }

    /// Settle the continuations of a job that has already finished.
    ///
    /// Recovers children left waiting when the settle that follows a
    /// finishing move did not complete. Children that already moved are
    /// skipped, so this can run any number of times.
    pub async fn settle_continuations(&self, job: &Job, now: DateTime<Utc>) -> Result<usize> {
        if !job.state.is_finished() {
            return Ok(0);
        }
        continuation::settle(&self.backend, &job.id, job.state, now).await
    }

    /// Record a failed attempt by `owner` and follow it with the retry
    /// policy's decision.
    ///
    /// Fails with `Conflict` if `owner` no longer holds the job, in which
    /// case nothing was written.
    pub async fn fail(
        &self,
        id: &JobId,
        owner: &str,
        error: &str,
        fatal: bool,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let failed = self
            .apply(
                id,
                &Expected::state(JobState::Processing).owned_by(owner),
                &JobEvent::Fail {
                    error: error.to_string(),
                },
                now,
            )
            .await?;
        self.decide_retry(&failed, fatal, policy, now).await
    }

    /// Move a `Failed` job to `Scheduled` or `FailedExhausted`.
    pub async fn decide_retry(
        &self,
        failed: &Job,
        fatal: bool,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let event = match policy.decide(failed.retry_count, fatal, now) {
            RetryDecision::RetryAt(at) => JobEvent::Retry { at },
            RetryDecision::Exhausted => JobEvent::Exhaust,
        };
        let job = self
            .apply(&failed.id, &Expected::state(JobState::Failed), &event, now)
            .await?;

        match job.state {
            JobState::Scheduled => tracing::debug!(
                job_id = %job.id,
                retry_count = job.retry_count,
                retry_at = ?job.scheduled_at,
                "Job scheduled for retry"
            ),
            _ => tracing::warn!(
                job_id = %job.id,
                retry_count = job.retry_count,
                error = job.last_error.as_deref().unwrap_or_default(),
                "Job failed permanently"
            ),
        }
        Ok(job)
    }

    /// Cancel a job in any non-terminal state.
    ///
    /// A `Processing` job keeps running; its outcome report is then
    /// discarded.
    pub async fn delete(&self, id: &JobId, now: DateTime<Utc>) -> Result<Job> {
        self.apply_current(id, &JobEvent::Delete, now).await
    }

    /// Put a `Scheduled`, `Failed` or `FailedExhausted` job back on its
    /// queue with a fresh retry count.
    pub async fn requeue(&self, id: &JobId, now: DateTime<Utc>) -> Result<Job> {
        self.apply_current(id, &JobEvent::Requeue, now).await
    }

    /// Apply `event` to whatever state the job is in, re-reading on
    /// `Conflict`.
    async fn apply_current(&self, id: &JobId, event: &JobEvent, now: DateTime<Utc>) -> Result<Job> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let job = self.backend.fetch(id).await?;
            match self
                .apply(id, &Expected::state(job.state), event, now)
                .await
            {
                Err(e) if e.is_conflict() && attempt < MAX_CONFLICT_ATTEMPTS => {
                    tracing::debug!(job_id = %id, attempt, "State changed underneath, retrying");
                }
                Err(BacklogError::Conflict(msg)) => {
                    return Err(BacklogError::Conflict(format!(
                        "{} (gave up after {} attempts)",
                        msg, attempt
                    )))
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ContinuationCondition, Invocation, JobOptions};
    use crate::memory::InMemoryBackend;
    use chrono::TimeZone;
    use std::time::Duration;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    async fn claimed(store: &InMemoryBackend) -> Job {
        let job = Job::enqueued(Invocation::unit("work"), JobOptions::default(), now());
        store.create(&job).await.unwrap();
        store
            .try_claim(&["default".to_string()], "w1", now(), Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_success_settles_continuations() {
        let store = InMemoryBackend::new();
        let lifecycle = Lifecycle::new(store.clone());
        let job = claimed(&store).await;
        let child = Job::awaiting(
            Invocation::unit("after"),
            JobOptions::default(),
            job.id.clone(),
            ContinuationCondition::OnSuccess,
            now(),
        );
        store.create(&child).await.unwrap();

        let done = lifecycle
            .apply(
                &job.id,
                &Expected::state(JobState::Processing).owned_by("w1"),
                &JobEvent::Succeed { result: None },
                now(),
            )
            .await
            .unwrap();
        assert_eq!(done.state, JobState::Succeeded);
        assert_eq!(store.fetch(&child.id).await.unwrap().state, JobState::Enqueued);
    }

    #[tokio::test]
    async fn test_fail_schedules_retry() {
        let store = InMemoryBackend::new();
        let lifecycle = Lifecycle::new(store.clone());
        let job = claimed(&store).await;
        let policy = RetryPolicy::fixed(3, Duration::from_secs(300));

        let retried = lifecycle
            .fail(&job.id, "w1", "boom", false, &policy, now())
            .await
            .unwrap();
        assert_eq!(retried.state, JobState::Scheduled);
        assert_eq!(retried.retry_count, 1);
        assert_eq!(
            retried.scheduled_at,
            Some(now() + chrono::Duration::seconds(300))
        );
    }

    #[tokio::test]
    async fn test_fatal_failure_exhausts() {
        let store = InMemoryBackend::new();
        let lifecycle = Lifecycle::new(store.clone());
        let job = claimed(&store).await;
        let policy = RetryPolicy::fixed(3, Duration::from_secs(300));

        let exhausted = lifecycle
            .fail(&job.id, "w1", "bad input", true, &policy, now())
            .await
            .unwrap();
        assert_eq!(exhausted.state, JobState::FailedExhausted);
        assert_eq!(exhausted.last_error.as_deref(), Some("bad input"));
    }

    #[tokio::test]
    async fn test_stale_owner_report_conflicts() {
        let store = InMemoryBackend::new();
        let lifecycle = Lifecycle::new(store.clone());
        let job = claimed(&store).await;
        let policy = RetryPolicy::no_retries();

        let err = lifecycle
            .fail(&job.id, "w2", "boom", false, &policy, now())
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.fetch(&job.id).await.unwrap().state, JobState::Processing);
    }

    #[tokio::test]
    async fn test_delete_processing_job_discards_report() {
        let store = InMemoryBackend::new();
        let lifecycle = Lifecycle::new(store.clone());
        let job = claimed(&store).await;

        let deleted = lifecycle.delete(&job.id, now()).await.unwrap();
        assert_eq!(deleted.state, JobState::Deleted);
        assert!(deleted.lease.is_none());

        let err = lifecycle
            .apply(
                &job.id,
                &Expected::state(JobState::Processing).owned_by("w1"),
                &JobEvent::Succeed { result: None },
                now(),
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.fetch(&job.id).await.unwrap().state, JobState::Deleted);
    }

    #[tokio::test]
    async fn test_delete_terminal_job_is_invalid() {
        let store = InMemoryBackend::new();
        let lifecycle = Lifecycle::new(store.clone());
        let job = claimed(&store).await;
        lifecycle.delete(&job.id, now()).await.unwrap();

        let err = lifecycle.delete(&job.id, now()).await.unwrap_err();
        assert!(matches!(
            err,
            BacklogError::InvalidTransition {
                from: JobState::Deleted,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_requeue_exhausted_job() {
        let store = InMemoryBackend::new();
        let lifecycle = Lifecycle::new(store.clone());
        let job = claimed(&store).await;
        lifecycle
            .fail(&job.id, "w1", "boom", true, &RetryPolicy::no_retries(), now())
            .await
            .unwrap();

        let requeued = lifecycle.requeue(&job.id, now()).await.unwrap();
        assert_eq!(requeued.state, JobState::Enqueued);
        assert_eq!(requeued.retry_count, 0);
    }
}
