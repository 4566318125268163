//! Reaper component for stale job recovery.
//!
//! The reaper periodically looks for `Processing` jobs whose lease lapsed
//! without a heartbeat (the worker died or hung) and puts them back on their
//! queue. It also finishes jobs stranded in `Failed` when a worker died
//! between recording a failure and applying the retry policy, and settles
//! continuations still waiting on a parent that already finished.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{lease_deadline, Backend};
use crate::error::{BacklogError, Result};
use crate::job::JobState;
use crate::lifecycle::Lifecycle;
use crate::registry::HandlerRegistry;
use crate::retrier::RetryPolicy;
use crate::state::{Expected, JobEvent};

/// What one reaper pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Jobs put back on their queue after a lease lapsed.
    pub recovered: usize,
    /// Stranded `Failed` jobs moved on by the retry policy.
    pub settled: usize,
    /// Continuations moved on after their parent finished.
    pub continued: usize,
}

/// Reaper that recovers jobs from dead workers.
pub struct Reaper<B: Backend> {
    lifecycle: Lifecycle<B>,
    registry: Arc<HandlerRegistry>,
    default_policy: Option<RetryPolicy>,
    interval: Duration,
    grace: Duration,
    batch_size: usize,
    running: Arc<AtomicBool>,
}

impl<B: Backend + Clone + 'static> Reaper<B> {
    /// Create a new reaper.
    ///
    /// `grace` is how long a job may sit in `Failed` before the reaper
    /// assumes its worker died.
    pub fn new(
        backend: B,
        registry: Arc<HandlerRegistry>,
        default_policy: Option<RetryPolicy>,
        interval: Duration,
        grace: Duration,
        batch_size: usize,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            lifecycle: Lifecycle::new(backend),
            registry,
            default_policy,
            interval,
            grace,
            batch_size,
            running,
        }
    }

    /// Run the reaper loop.
    pub async fn run(&self) -> Result<()> {
        tracing::debug!("Reaper started");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;

            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            if let Err(e) = self.tick().await {
                if e.is_transient() {
                    tracing::warn!(error = %e, "Store unavailable, reaper will retry");
                } else {
                    tracing::error!(error = %e, "Reaper tick failed");
                }
            }
        }

        tracing::debug!("Reaper stopped");
        Ok(())
    }

    /// Run one pass now.
    pub async fn tick(&self) -> Result<ReapReport> {
        self.tick_at(Utc::now()).await
    }

    /// Run one pass as of `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<ReapReport> {
        let report = ReapReport {
            recovered: self.recover_expired(now).await?,
            settled: self.settle_stranded(now).await?,
            continued: self.settle_orphaned_continuations(now).await?,
        };
        if report != ReapReport::default() {
            tracing::info!(
                recovered = report.recovered,
                settled = report.settled,
                continued = report.continued,
                "Reaper pass complete"
            );
        }
        Ok(report)
    }

    async fn recover_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired = self
            .lifecycle
            .backend()
            .list_expired_leases(now, self.batch_size)
            .await?;

        let mut recovered = 0;
        for id in expired {
            // A heartbeat may land between the listing and this update; the
            // lease check makes that a conflict instead of a stolen job.
            let expected = Expected::state(JobState::Processing).lease_expired_by(now);
            match self
                .lifecycle
                .apply(&id, &expected, &JobEvent::LeaseExpired, now)
                .await
            {
                Ok(_) => {
                    recovered += 1;
                    tracing::warn!(job_id = %id, "Lease expired, job re-enqueued");
                }
                Err(e) if e.is_conflict() => {
                    tracing::debug!(job_id = %id, "Lease renewed or job finished, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(recovered)
    }

    async fn settle_stranded(&self, now: DateTime<Utc>) -> Result<usize> {
        let failed = self
            .lifecycle
            .backend()
            .list_jobs(JobState::Failed, self.batch_size, 0)
            .await?;

        let mut settled = 0;
        for job in failed {
            let failed_at = job.history.last().map(|r| r.at).unwrap_or(job.created_at);
            if lease_deadline(failed_at, self.grace) > now {
                continue;
            }

            let policy = self
                .registry
                .resolve_policy(&job, self.default_policy.as_ref())
                .unwrap_or_else(RetryPolicy::no_retries);
            match self.lifecycle.decide_retry(&job, false, &policy, now).await {
                Ok(_) => {
                    settled += 1;
                    tracing::warn!(job_id = %job.id, "Settled job stranded in Failed");
                }
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(settled)
    }

    /// Settle children whose parent finished without its continuations
    /// being settled, e.g. the store failed right after the parent's move.
    async fn settle_orphaned_continuations(&self, now: DateTime<Utc>) -> Result<usize> {
        let backend = self.lifecycle.backend();

        // Collect parents first; settling shrinks the set being paged.
        let mut parents = BTreeSet::new();
        let mut offset = 0;
        loop {
            let page = backend
                .list_jobs(JobState::AwaitingContinuation, self.batch_size, offset)
                .await?;
            let len = page.len();
            parents.extend(page.into_iter().filter_map(|job| job.parent_id));
            if len == 0 || len < self.batch_size {
                break;
            }
            offset += len;
        }

        let mut settled = 0;
        for parent_id in parents {
            let parent = match backend.fetch(&parent_id).await {
                Ok(parent) => parent,
                Err(BacklogError::JobNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if !parent.state.is_finished() {
                continue;
            }
            let n = self.lifecycle.settle_continuations(&parent, now).await?;
            if n > 0 {
                tracing::warn!(job_id = %parent.id, children = n, "Settled orphaned continuations");
            }
            settled += n;
        }
        Ok(settled)
    }
}
