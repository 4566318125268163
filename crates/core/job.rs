//! Job definition and related types.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{BacklogError, Result};
use crate::retrier::RetryPolicy;

/// Queue used when a submission does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// Namespace for deterministic recurring-occurrence ids.
const OCCURRENCE_NAMESPACE: Uuid = Uuid::from_u128(0x6b1d_54f2_8a3e_4c07_9d51_2f0e_a7c4_3b18);

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a new random JobId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic id for one occurrence of a recurring definition.
    ///
    /// Two schedulers firing the same occurrence produce the same id, so the
    /// store rejects the second creation.
    pub fn for_occurrence(name: &str, due: DateTime<Utc>) -> Self {
        let key = format!("{}@{}", name, due.timestamp_millis());
        Self(Uuid::new_v5(&OCCURRENCE_NAMESPACE, key.as_bytes()))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = BacklogError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(JobId)
            .map_err(|e| BacklogError::JobNotFound(format!("invalid job id {:?}: {}", s, e)))
    }
}

/// Serializable description of the work to run: a registered handler name
/// plus its JSON arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    /// Name the handler was registered under.
    pub handler: String,
    /// Handler arguments.
    pub args: serde_json::Value,
}

impl Invocation {
    /// Build an invocation from any serializable argument value.
    pub fn new<A: Serialize>(handler: impl Into<String>, args: &A) -> Result<Self> {
        Ok(Self {
            handler: handler.into(),
            args: serde_json::to_value(args)?,
        })
    }

    /// Invocation of a handler that takes no arguments.
    pub fn unit(handler: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            args: serde_json::Value::Null,
        }
    }

    /// Decode the arguments into the handler's payload type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.args.clone())?)
    }
}

/// The state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Waiting for its due time.
    Scheduled,
    /// Ready to be claimed by a worker.
    Enqueued,
    /// Claimed by a worker under a lease.
    Processing,
    /// Completed successfully.
    Succeeded,
    /// Last attempt failed; the retry policy has not decided yet.
    Failed,
    /// Failed and out of retries. Kept for inspection or manual requeue.
    FailedExhausted,
    /// Waiting for its parent to finish.
    AwaitingContinuation,
    /// Cancelled.
    Deleted,
}

impl JobState {
    /// Every state, in lifecycle order.
    pub const ALL: [JobState; 8] = [
        JobState::Scheduled,
        JobState::Enqueued,
        JobState::Processing,
        JobState::Succeeded,
        JobState::Failed,
        JobState::FailedExhausted,
        JobState::AwaitingContinuation,
        JobState::Deleted,
    ];

    /// States nothing can leave.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Deleted)
    }

    /// States that settle continuations waiting on this job.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::FailedExhausted | JobState::Deleted
        )
    }

    /// Stable storage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Scheduled => "scheduled",
            JobState::Enqueued => "enqueued",
            JobState::Processing => "processing",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::FailedExhausted => "failed_exhausted",
            JobState::AwaitingContinuation => "awaiting_continuation",
            JobState::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = BacklogError;

    fn from_str(s: &str) -> Result<Self> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| BacklogError::Backend(format!("unknown job state {:?}", s)))
    }
}

/// When a continuation fires relative to its parent's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContinuationCondition {
    /// Only if the parent succeeded.
    OnSuccess,
    /// Whenever the parent finishes, whatever the outcome.
    OnAnyOutcome,
}

impl ContinuationCondition {
    /// Whether a parent that finished in `parent` satisfies this condition.
    pub fn is_satisfied_by(&self, parent: JobState) -> bool {
        match self {
            ContinuationCondition::OnSuccess => parent == JobState::Succeeded,
            ContinuationCondition::OnAnyOutcome => parent.is_finished(),
        }
    }
}

/// Time-bounded claim on a job held by one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Worker holding the lease.
    pub owner: String,
    /// When the lease lapses unless extended.
    pub expires_at: DateTime<Utc>,
}

/// One entry of a job's state history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// State entered.
    pub state: JobState,
    /// When it was entered.
    pub at: DateTime<Utc>,
    /// Why, when there is something to say (error message, retry note).
    pub reason: Option<String>,
}

/// Per-submission options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Queue to place the job on.
    pub queue: String,
    /// Retry policy overriding the handler's and the pool's.
    pub retry: Option<RetryPolicy>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            retry: None,
        }
    }
}

impl JobOptions {
    /// Set the queue.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Set the retry policy.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }
}

/// A job with its invocation and metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier.
    pub id: JobId,
    /// What to run.
    pub invocation: Invocation,
    /// Queue the job is consumed from.
    pub queue: String,
    /// Current state.
    pub state: JobState,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When a scheduled job becomes due.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// When the job last entered the ready queue (FIFO key).
    pub enqueued_at: Option<DateTime<Utc>>,
    /// Failed attempts recorded so far.
    pub retry_count: u32,
    /// Retry policy chosen at submission, if any.
    pub retry: Option<RetryPolicy>,
    /// Parent job, for continuations.
    pub parent_id: Option<JobId>,
    /// Condition on the parent's outcome, for continuations.
    pub continuation: Option<ContinuationCondition>,
    /// Recurring definition that spawned this job.
    pub recurring: Option<String>,
    /// Active processing lease.
    pub lease: Option<Lease>,
    /// Handler output of a successful run.
    pub result: Option<serde_json::Value>,
    /// Error message from the last failure.
    pub last_error: Option<String>,
    /// Every state the job went through.
    pub history: Vec<StateRecord>,
}

impl Job {
    fn base(invocation: Invocation, options: JobOptions, state: JobState, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            invocation,
            queue: options.queue,
            state,
            created_at: now,
            scheduled_at: None,
            enqueued_at: None,
            retry_count: 0,
            retry: options.retry,
            parent_id: None,
            continuation: None,
            recurring: None,
            lease: None,
            result: None,
            last_error: None,
            history: vec![StateRecord {
                state,
                at: now,
                reason: None,
            }],
        }
    }

    /// A job ready for immediate processing.
    pub fn enqueued(invocation: Invocation, options: JobOptions, now: DateTime<Utc>) -> Self {
        let mut job = Self::base(invocation, options, JobState::Enqueued, now);
        job.enqueued_at = Some(now);
        job
    }

    /// A job that becomes ready at `at`.
    pub fn scheduled(
        invocation: Invocation,
        options: JobOptions,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut job = Self::base(invocation, options, JobState::Scheduled, now);
        job.scheduled_at = Some(at);
        job
    }

    /// A continuation waiting on `parent`.
    pub fn awaiting(
        invocation: Invocation,
        options: JobOptions,
        parent: JobId,
        condition: ContinuationCondition,
        now: DateTime<Utc>,
    ) -> Self {
        let mut job = Self::base(invocation, options, JobState::AwaitingContinuation, now);
        job.parent_id = Some(parent);
        job.continuation = Some(condition);
        job
    }

    /// Replace the generated id.
    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    /// Whether `owner` holds the current lease.
    pub fn is_leased_by(&self, owner: &str) -> bool {
        self.lease.as_ref().is_some_and(|lease| lease.owner == owner)
    }

    /// Whether the current lease lapsed at or before `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_some_and(|lease| lease.expires_at <= now)
    }

    /// Serialize the job to JSON.
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize a job from JSON.
    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Serde module for Duration serialization as milliseconds.
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(durations: &[Duration], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis: Vec<u64> = durations.iter().map(|d| d.as_millis() as u64).collect();
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Vec<u64> = Vec::deserialize(deserializer)?;
        Ok(millis.into_iter().map(Duration::from_millis).collect())
    }
}
