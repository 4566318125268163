//! Lease heartbeats for running jobs.
//!
//! While a handler runs, the worker periodically pushes the job's lease
//! expiry forward. If the worker dies the heartbeats stop, the lease lapses
//! and the reaper hands the job to someone else.

use chrono::Utc;
use std::time::Duration;

use crate::backend::{lease_deadline, Backend};
use crate::job::JobId;

/// Extends one job's lease on behalf of its owner.
pub(crate) struct Heartbeat<'a, B: Backend> {
    backend: &'a B,
    job_id: &'a JobId,
    owner: &'a str,
    lease: Duration,
}

impl<'a, B: Backend> Heartbeat<'a, B> {
    pub(crate) fn new(backend: &'a B, job_id: &'a JobId, owner: &'a str, lease: Duration) -> Self {
        Self {
            backend,
            job_id,
            owner,
            lease,
        }
    }

    /// Send one heartbeat. Returns false once the lease is lost for good.
    pub(crate) async fn beat(&self) -> bool {
        let until = lease_deadline(Utc::now(), self.lease);
        match self.backend.extend_lease(self.job_id, self.owner, until).await {
            Ok(()) => {
                tracing::trace!(job_id = %self.job_id, owner = %self.owner, "Lease extended");
                true
            }
            Err(e) if e.is_conflict() => {
                tracing::warn!(
                    job_id = %self.job_id,
                    owner = %self.owner,
                    "Lease lost; the outcome of this run will be discarded"
                );
                false
            }
            Err(e) => {
                tracing::warn!(job_id = %self.job_id, error = %e, "Failed to extend lease");
                true
            }
        }
    }
}

/// Generate a unique pool ID.
pub fn generate_pool_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let pid = std::process::id();
    let ts = Utc::now().timestamp();
    format!("{}-{}-{}", host, pid, ts)
}
