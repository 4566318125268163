//! Continuation settling.
//!
//! When a job finishes, every child still waiting on it either becomes
//! `Enqueued` (condition met) or `Deleted` (condition unmet). A deleted child
//! is itself finished, so its own children are settled in turn. The walk is
//! iterative; chains of any depth use a bounded stack.

use chrono::{DateTime, Utc};

use crate::backend::Backend;
use crate::error::{BacklogError, Result};
use crate::job::{ContinuationCondition, JobId, JobState};
use crate::state::{Expected, JobEvent, StateChange};

/// Settle the continuations of a parent that just reached `parent_state`.
///
/// Returns how many children changed state. Children already moved by a
/// concurrent settle are skipped.
pub(crate) async fn settle<B: Backend + ?Sized>(
    backend: &B,
    parent: &JobId,
    parent_state: JobState,
    now: DateTime<Utc>,
) -> Result<usize> {
    let mut settled = 0;
    let mut pending = vec![(parent.clone(), parent_state)];

    while let Some((parent_id, parent_state)) = pending.pop() {
        for child_id in backend.continuations(&parent_id).await? {
            let child = match backend.fetch(&child_id).await {
                Ok(child) => child,
                Err(BacklogError::JobNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if child.state != JobState::AwaitingContinuation {
                continue;
            }

            let satisfied = child
                .continuation
                .unwrap_or(ContinuationCondition::OnSuccess)
                .is_satisfied_by(parent_state);
            let change = StateChange::new(
                JobState::AwaitingContinuation,
                &JobEvent::ParentFinished { satisfied },
                now,
            )?;

            match backend
                .update_state(
                    &child_id,
                    &Expected::state(JobState::AwaitingContinuation),
                    &change,
                )
                .await
            {
                Ok(updated) => {
                    settled += 1;
                    tracing::debug!(
                        job_id = %child_id,
                        parent_id = %parent_id,
                        state = %updated.state,
                        "Continuation settled"
                    );
                    if change.fires_continuations() {
                        pending.push((child_id, updated.state));
                    }
                }
                Err(e) if e.is_conflict() => {
                    tracing::debug!(job_id = %child_id, "Continuation already settled");
                }
                Err(e) => return Err(e),
            }
        }
    }

    Ok(settled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Invocation, Job, JobOptions};
    use crate::memory::InMemoryBackend;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn child_of(parent: &JobId, condition: ContinuationCondition) -> Job {
        Job::awaiting(
            Invocation::unit("child"),
            JobOptions::default(),
            parent.clone(),
            condition,
            now(),
        )
    }

    #[tokio::test]
    async fn test_success_fires_every_child() {
        let store = InMemoryBackend::new();
        let parent = JobId::new();
        let on_success = child_of(&parent, ContinuationCondition::OnSuccess);
        let on_any = child_of(&parent, ContinuationCondition::OnAnyOutcome);
        store.create(&on_success).await.unwrap();
        store.create(&on_any).await.unwrap();

        let settled = settle(&store, &parent, JobState::Succeeded, now()).await.unwrap();
        assert_eq!(settled, 2);
        assert_eq!(store.fetch(&on_success.id).await.unwrap().state, JobState::Enqueued);
        assert_eq!(store.fetch(&on_any.id).await.unwrap().state, JobState::Enqueued);
    }

    #[tokio::test]
    async fn test_exhausted_parent_deletes_on_success_child() {
        let store = InMemoryBackend::new();
        let parent = JobId::new();
        let on_success = child_of(&parent, ContinuationCondition::OnSuccess);
        let on_any = child_of(&parent, ContinuationCondition::OnAnyOutcome);
        store.create(&on_success).await.unwrap();
        store.create(&on_any).await.unwrap();

        settle(&store, &parent, JobState::FailedExhausted, now()).await.unwrap();
        assert_eq!(store.fetch(&on_success.id).await.unwrap().state, JobState::Deleted);
        assert_eq!(store.fetch(&on_any.id).await.unwrap().state, JobState::Enqueued);
    }

    #[tokio::test]
    async fn test_deleted_child_cascades() {
        let store = InMemoryBackend::new();
        let root = JobId::new();
        let child = child_of(&root, ContinuationCondition::OnSuccess);
        let grandchild = child_of(&child.id, ContinuationCondition::OnSuccess);
        let cleanup = child_of(&child.id, ContinuationCondition::OnAnyOutcome);
        store.create(&child).await.unwrap();
        store.create(&grandchild).await.unwrap();
        store.create(&cleanup).await.unwrap();

        let settled = settle(&store, &root, JobState::Deleted, now()).await.unwrap();
        assert_eq!(settled, 3);
        assert_eq!(store.fetch(&child.id).await.unwrap().state, JobState::Deleted);
        assert_eq!(store.fetch(&grandchild.id).await.unwrap().state, JobState::Deleted);
        assert_eq!(store.fetch(&cleanup.id).await.unwrap().state, JobState::Enqueued);
    }

    #[tokio::test]
    async fn test_settling_twice_is_a_no_op() {
        let store = InMemoryBackend::new();
        let parent = JobId::new();
        let child = child_of(&parent, ContinuationCondition::OnSuccess);
        store.create(&child).await.unwrap();

        assert_eq!(settle(&store, &parent, JobState::Succeeded, now()).await.unwrap(), 1);
        assert_eq!(settle(&store, &parent, JobState::Succeeded, now()).await.unwrap(), 0);
        assert_eq!(store.fetch(&child.id).await.unwrap().history.len(), 2);
    }
}
