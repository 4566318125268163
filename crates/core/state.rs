//! Job state machine.
//!
//! [`transition`] is a pure function from (state, event) to the next state
//! and the side effects the move implies. Stores apply the resulting
//! [`StateChange`] to a record under an [`Expected`] precondition; nothing
//! here touches storage.
//!
//! ```text
//! Scheduled -> Enqueued -> Processing -> Succeeded
//!                  ^            |
//!                  |            +-> Failed -> Scheduled (retry)
//!                  |                     \-> FailedExhausted
//!                  +-- AwaitingContinuation -> Deleted
//! ```

use chrono::{DateTime, Utc};

use crate::error::{BacklogError, Result};
use crate::job::{Job, JobState, Lease, StateRecord};

/// Something that happened to a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// A scheduled job became due.
    Promote,
    /// A worker claimed the job.
    Claim {
        /// Worker taking the lease.
        owner: String,
        /// Lease expiry.
        lease_until: DateTime<Utc>,
    },
    /// The handler returned successfully.
    Succeed {
        /// Handler output, if any.
        result: Option<serde_json::Value>,
    },
    /// The handler failed.
    Fail {
        /// Error message.
        error: String,
    },
    /// The retry policy scheduled another attempt.
    Retry {
        /// When the attempt becomes due.
        at: DateTime<Utc>,
    },
    /// The retry policy gave up.
    Exhaust,
    /// The processing lease lapsed without a heartbeat.
    LeaseExpired,
    /// The parent of a continuation finished.
    ParentFinished {
        /// Whether the continuation's condition holds.
        satisfied: bool,
    },
    /// Cancellation.
    Delete,
    /// Manual re-enqueue.
    Requeue,
}

impl JobEvent {
    /// Short event name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Promote => "Promote",
            JobEvent::Claim { .. } => "Claim",
            JobEvent::Succeed { .. } => "Succeed",
            JobEvent::Fail { .. } => "Fail",
            JobEvent::Retry { .. } => "Retry",
            JobEvent::Exhaust => "Exhaust",
            JobEvent::LeaseExpired => "LeaseExpired",
            JobEvent::ParentFinished { .. } => "ParentFinished",
            JobEvent::Delete => "Delete",
            JobEvent::Requeue => "Requeue",
        }
    }
}

/// Effect implied by a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    /// Put the job at the back of its ready queue.
    Enqueue,
    /// Put the job on the schedule at `at`.
    Schedule {
        /// Due time.
        at: DateTime<Utc>,
    },
    /// Grant a processing lease.
    AcquireLease {
        /// Lease holder.
        owner: String,
        /// Lease expiry.
        until: DateTime<Utc>,
    },
    /// Drop the processing lease.
    ReleaseLease,
    /// Store the handler output.
    RecordResult(Option<serde_json::Value>),
    /// Store the failure message.
    RecordError(String),
    /// Count one more failure.
    IncrementRetries,
    /// Start the failure count over.
    ResetRetries,
    /// The caller must now decide between `Retry` and `Exhaust`.
    ApplyRetryPolicy,
    /// Settle continuations waiting on this job.
    FireContinuations,
}

/// Result of the transition function.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// State before.
    pub from: JobState,
    /// State after.
    pub to: JobState,
    /// Effects to carry out.
    pub effects: Vec<SideEffect>,
    /// Note for the state history.
    pub reason: Option<String>,
}

/// Compute the next state for `event` in state `current`.
pub fn transition(current: JobState, event: &JobEvent) -> Result<Transition> {
    use JobState::*;

    let (to, effects, reason) = match (current, event) {
        (Scheduled, JobEvent::Promote) => (Enqueued, vec![SideEffect::Enqueue], None),
        (Enqueued, JobEvent::Claim { owner, lease_until }) => (
            Processing,
            vec![SideEffect::AcquireLease {
                owner: owner.clone(),
                until: *lease_until,
            }],
            None,
        ),
        (Processing, JobEvent::Succeed { result }) => (
            Succeeded,
            vec![
                SideEffect::ReleaseLease,
                SideEffect::RecordResult(result.clone()),
                SideEffect::FireContinuations,
            ],
            None,
        ),
        (Processing, JobEvent::Fail { error }) => (
            Failed,
            vec![
                SideEffect::ReleaseLease,
                SideEffect::RecordError(error.clone()),
                SideEffect::IncrementRetries,
                SideEffect::ApplyRetryPolicy,
            ],
            Some(error.clone()),
        ),
        (Failed, JobEvent::Retry { at }) => (
            Scheduled,
            vec![SideEffect::Schedule { at: *at }],
            Some(format!("retry due at {}", at.to_rfc3339())),
        ),
        (Failed, JobEvent::Exhaust) => (
            FailedExhausted,
            vec![SideEffect::FireContinuations],
            Some("retries exhausted".to_string()),
        ),
        (Processing, JobEvent::LeaseExpired) => (
            Enqueued,
            vec![SideEffect::ReleaseLease, SideEffect::Enqueue],
            Some("lease expired".to_string()),
        ),
        (AwaitingContinuation, JobEvent::ParentFinished { satisfied: true }) => {
            (Enqueued, vec![SideEffect::Enqueue], None)
        }
        (AwaitingContinuation, JobEvent::ParentFinished { satisfied: false }) => (
            Deleted,
            vec![SideEffect::FireContinuations],
            Some("continuation condition not met".to_string()),
        ),
        (from, JobEvent::Delete) if !from.is_terminal() => {
            let mut effects = Vec::with_capacity(2);
            if from == Processing {
                effects.push(SideEffect::ReleaseLease);
            }
            effects.push(SideEffect::FireContinuations);
            (Deleted, effects, None)
        }
        (Scheduled | Failed | FailedExhausted, JobEvent::Requeue) => (
            Enqueued,
            vec![SideEffect::ResetRetries, SideEffect::Enqueue],
            Some("requeued".to_string()),
        ),
        (from, event) => {
            return Err(BacklogError::InvalidTransition {
                from,
                event: event.name().to_string(),
            })
        }
    };

    Ok(Transition {
        from: current,
        to,
        effects,
        reason,
    })
}

/// A validated transition stamped with the time it happens.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    /// The transition to apply.
    pub transition: Transition,
    /// When it happens.
    pub at: DateTime<Utc>,
}

impl StateChange {
    /// Validate `event` against `current` and stamp it.
    pub fn new(current: JobState, event: &JobEvent, at: DateTime<Utc>) -> Result<Self> {
        Ok(Self {
            transition: transition(current, event)?,
            at,
        })
    }

    /// Target state.
    pub fn to(&self) -> JobState {
        self.transition.to
    }

    /// Whether the change settles continuations.
    pub fn fires_continuations(&self) -> bool {
        self.transition
            .effects
            .contains(&SideEffect::FireContinuations)
    }

    /// Whether the caller must consult the retry policy next.
    pub fn needs_retry_decision(&self) -> bool {
        self.transition
            .effects
            .contains(&SideEffect::ApplyRetryPolicy)
    }

    /// Write the change into a job record.
    pub fn apply(&self, job: &mut Job) {
        job.state = self.transition.to;
        for effect in &self.transition.effects {
            match effect {
                SideEffect::Enqueue => {
                    job.enqueued_at = Some(self.at);
                    job.scheduled_at = None;
                }
                SideEffect::Schedule { at } => job.scheduled_at = Some(*at),
                SideEffect::AcquireLease { owner, until } => {
                    job.lease = Some(Lease {
                        owner: owner.clone(),
                        expires_at: *until,
                    })
                }
                SideEffect::ReleaseLease => job.lease = None,
                SideEffect::RecordResult(result) => job.result = result.clone(),
                SideEffect::RecordError(error) => job.last_error = Some(error.clone()),
                SideEffect::IncrementRetries => job.retry_count += 1,
                SideEffect::ResetRetries => job.retry_count = 0,
                SideEffect::ApplyRetryPolicy | SideEffect::FireContinuations => {}
            }
        }
        job.history.push(StateRecord {
            state: self.transition.to,
            at: self.at,
            reason: self.transition.reason.clone(),
        });
    }
}

/// Precondition a stored record must meet for an update to go through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expected {
    /// Required current state.
    pub state: JobState,
    /// Required lease holder.
    pub lease_owner: Option<String>,
    /// Lease must have lapsed by this time.
    pub lease_expired_by: Option<DateTime<Utc>>,
}

impl Expected {
    /// Require the job to be in `state`.
    pub fn state(state: JobState) -> Self {
        Self {
            state,
            lease_owner: None,
            lease_expired_by: None,
        }
    }

    /// Also require `owner` to hold the lease.
    pub fn owned_by(mut self, owner: impl Into<String>) -> Self {
        self.lease_owner = Some(owner.into());
        self
    }

    /// Also require the lease to have lapsed by `now`.
    pub fn lease_expired_by(mut self, now: DateTime<Utc>) -> Self {
        self.lease_expired_by = Some(now);
        self
    }

    /// Check a stored record, returning `Conflict` on mismatch.
    pub fn check(&self, job: &Job) -> Result<()> {
        if job.state != self.state {
            return Err(BacklogError::Conflict(format!(
                "job {} is {}, expected {}",
                job.id, job.state, self.state
            )));
        }
        if let Some(owner) = &self.lease_owner {
            if !job.is_leased_by(owner) {
                return Err(BacklogError::Conflict(format!(
                    "job {} is not leased by {}",
                    job.id, owner
                )));
            }
        }
        if let Some(now) = self.lease_expired_by {
            if !job.lease_expired(now) {
                return Err(BacklogError::Conflict(format!(
                    "job {} lease is still live",
                    job.id
                )));
            }
        }
        Ok(())
    }
}
