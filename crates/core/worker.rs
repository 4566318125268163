//! Workers: claim, execute, report.

use chrono::Utc;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::backend::Backend;
use crate::config::WorkerConfig;
use crate::error::{BacklogError, Result};
use crate::heartbeat::Heartbeat;
use crate::job::{Job, JobState};
use crate::lifecycle::Lifecycle;
use crate::registry::HandlerRegistry;
use crate::retrier::RetryPolicy;
use crate::state::{Expected, JobEvent};

/// Attempts at reporting an outcome while the store is unavailable.
const REPORT_ATTEMPTS: u32 = 3;

/// Result type for job handlers.
pub type JobResult<R = ()> = std::result::Result<R, JobError>;

/// Error returned from job handlers.
#[derive(Debug)]
pub struct JobError {
    /// Error message.
    pub message: String,
    /// Whether the job should be retried.
    pub retryable: bool,
}

impl JobError {
    /// Create a new retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a new non-retryable error (job goes straight to FailedExhausted).
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl<E: std::error::Error> From<E> for JobError {
    fn from(err: E) -> Self {
        Self::retryable(err.to_string())
    }
}

/// Flags shared by a pool and its workers.
#[derive(Clone, Default)]
pub(crate) struct Signals {
    pub(crate) running: Arc<AtomicBool>,
    pub(crate) draining: Arc<AtomicBool>,
    pub(crate) in_progress: Arc<AtomicUsize>,
    pub(crate) drain_notify: Arc<Notify>,
}

/// Individual worker that processes jobs.
pub struct Worker<B: Backend> {
    id: usize,
    owner: String,
    lifecycle: Lifecycle<B>,
    registry: Arc<HandlerRegistry>,
    config: Arc<WorkerConfig>,
    signals: Signals,
}

impl<B: Backend + Clone + 'static> Worker<B> {
    pub(crate) fn new(
        id: usize,
        pool_id: &str,
        backend: B,
        registry: Arc<HandlerRegistry>,
        config: Arc<WorkerConfig>,
        signals: Signals,
    ) -> Self {
        Self {
            id,
            owner: format!("{}/{}", pool_id, id),
            lifecycle: Lifecycle::new(backend),
            registry,
            config,
            signals,
        }
    }

    /// Lease owner name this worker claims under.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Claim and run jobs until the pool stops or starts draining.
    ///
    /// Store outages back off between `fetch_backoff_min` and
    /// `fetch_backoff_max` instead of ending the loop.
    pub async fn run(&self) -> Result<()> {
        tracing::debug!(worker_id = self.id, owner = %self.owner, "Worker started");

        let mut backoff = self.config.fetch_backoff_min;
        while self.signals.running.load(Ordering::SeqCst) {
            if self.signals.draining.load(Ordering::SeqCst) {
                tracing::debug!(worker_id = self.id, "Worker draining, stopping fetch");
                break;
            }

            match self.process_next().await {
                Ok(Some(_)) => {
                    backoff = self.config.fetch_backoff_min;
                    continue;
                }
                Ok(None) => {}
                Err(e) if e.is_transient() => {
                    tracing::warn!(worker_id = self.id, error = %e, "Store unavailable, backing off");
                }
                Err(e) => {
                    tracing::error!(worker_id = self.id, error = %e, "Worker error");
                }
            }

            tokio::time::sleep(backoff).await;
            backoff = backoff
                .saturating_mul(2)
                .min(self.config.fetch_backoff_max);
        }

        tracing::debug!(worker_id = self.id, "Worker stopped");
        Ok(())
    }

    /// Claim one job, run it and report the outcome.
    ///
    /// Returns `None` when no job was ready, otherwise the job as it stands
    /// after the report.
    pub async fn process_next(&self) -> Result<Option<Job>> {
        let claimed = self
            .lifecycle
            .backend()
            .try_claim(
                &self.config.queues,
                &self.owner,
                Utc::now(),
                self.config.lease_duration,
            )
            .await?;
        let Some(job) = claimed else {
            return Ok(None);
        };

        self.signals.in_progress.fetch_add(1, Ordering::SeqCst);
        let result = self.execute(&job).await;
        self.signals.in_progress.fetch_sub(1, Ordering::SeqCst);
        self.signals.drain_notify.notify_one();

        result.map(Some)
    }

    async fn execute(&self, job: &Job) -> Result<Job> {
        tracing::debug!(
            worker_id = self.id,
            job_id = %job.id,
            handler = %job.invocation.handler,
            queue = %job.queue,
            "Processing job"
        );

        let outcome = match self.registry.prepare(&job.invocation) {
            Ok(fut) => self.supervise(job, tokio::spawn(fut)).await,
            Err(err) => Err(err),
        };
        self.report(job, outcome).await
    }

    /// Wait for the handler task while keeping the lease alive.
    async fn supervise(
        &self,
        job: &Job,
        mut task: JoinHandle<JobResult<Option<serde_json::Value>>>,
    ) -> JobResult<Option<serde_json::Value>> {
        let heartbeat = Heartbeat::new(
            self.lifecycle.backend(),
            &job.id,
            &self.owner,
            self.config.lease_duration,
        );
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick fires immediately; the claim itself set a fresh lease.
        ticker.tick().await;

        let mut beating = true;
        loop {
            tokio::select! {
                joined = &mut task => {
                    return match joined {
                        Ok(outcome) => outcome,
                        Err(e) if e.is_panic() => Err(JobError::retryable(format!(
                            "handler panicked: {}",
                            panic_message(e.into_panic())
                        ))),
                        Err(e) => Err(JobError::retryable(format!("handler task failed: {}", e))),
                    };
                }
                _ = ticker.tick(), if beating => {
                    beating = heartbeat.beat().await;
                }
            }
        }
    }

    /// Record the outcome. A report for a job this worker no longer holds is
    /// discarded.
    async fn report(
        &self,
        job: &Job,
        outcome: JobResult<Option<serde_json::Value>>,
    ) -> Result<Job> {
        let mut attempt = 0;
        let mut delay = self.config.fetch_backoff_min;

        loop {
            let result = match &outcome {
                Ok(value) => {
                    self.lifecycle
                        .apply(
                            &job.id,
                            &Expected::state(JobState::Processing).owned_by(&self.owner),
                            &JobEvent::Succeed {
                                result: value.clone(),
                            },
                            Utc::now(),
                        )
                        .await
                }
                Err(err) => {
                    let policy = self
                        .registry
                        .resolve_policy(job, self.config.retry_policy.as_ref())
                        .unwrap_or_else(RetryPolicy::no_retries);
                    self.lifecycle
                        .fail(
                            &job.id,
                            &self.owner,
                            &err.message,
                            !err.retryable,
                            &policy,
                            Utc::now(),
                        )
                        .await
                }
            };

            match result {
                Ok(updated) => {
                    match &outcome {
                        Ok(_) => tracing::debug!(
                            worker_id = self.id,
                            job_id = %job.id,
                            "Job completed successfully"
                        ),
                        Err(err) => tracing::warn!(
                            worker_id = self.id,
                            job_id = %job.id,
                            state = %updated.state,
                            retry_count = updated.retry_count,
                            error = %BacklogError::PayloadExecution(err.message.clone()),
                            "Job failed"
                        ),
                    }
                    return Ok(updated);
                }
                Err(e) if e.is_conflict() => {
                    tracing::warn!(
                        worker_id = self.id,
                        job_id = %job.id,
                        error = %e,
                        "Outcome discarded, job no longer held by this worker"
                    );
                    // An earlier attempt may have landed before its settle failed.
                    let current = self.lifecycle.backend().fetch(&job.id).await?;
                    if let Err(e) = self
                        .lifecycle
                        .settle_continuations(&current, Utc::now())
                        .await
                    {
                        tracing::warn!(
                            worker_id = self.id,
                            job_id = %job.id,
                            error = %e,
                            "Failed to settle continuations, leaving them to the reaper"
                        );
                    }
                    return Ok(current);
                }
                Err(e) if e.is_transient() && attempt < REPORT_ATTEMPTS => {
                    attempt += 1;
                    tracing::warn!(
                        worker_id = self.id,
                        job_id = %job.id,
                        attempt,
                        error = %e,
                        "Failed to report outcome, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2).min(Duration::from_secs(5));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ContinuationCondition, Invocation, JobOptions};
    use crate::memory::InMemoryBackend;
    use crate::testing::FlakyBackend;

    fn worker<B: Backend + Clone + 'static>(store: &B, registry: HandlerRegistry) -> Worker<B> {
        let config = WorkerConfig::builder()
            .lease_duration(Duration::from_secs(30))
            .heartbeat_interval(Duration::from_millis(10))
            .fetch_backoff(Duration::from_millis(5), Duration::from_millis(20))
            .retry_policy(RetryPolicy::fixed(2, Duration::from_secs(60)))
            .build();
        Worker::new(
            0,
            "test-pool",
            store.clone(),
            Arc::new(registry),
            Arc::new(config),
            Signals::default(),
        )
    }

    async fn enqueue<B: Backend>(store: &B, invocation: Invocation) -> Job {
        let job = Job::enqueued(invocation, JobOptions::default(), Utc::now());
        store.create(&job).await.unwrap();
        job
    }

    #[test]
    fn test_job_error_constructors() {
        assert!(JobError::retryable("x").retryable);
        assert!(!JobError::fatal("x").retryable);

        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err: JobError = io.into();
        assert!(err.retryable);
        assert_eq!(err.to_string(), "disk gone");
    }

    #[tokio::test]
    async fn test_idle_worker_returns_none() {
        let store = InMemoryBackend::new();
        let worker = worker(&store, HandlerRegistry::new());
        assert!(worker.process_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_success_records_result() {
        let store = InMemoryBackend::new();
        let registry =
            HandlerRegistry::new().register("double", |n: i64| async move { Ok::<_, JobError>(n * 2) });
        let job = enqueue(&store, Invocation::new("double", &21).unwrap()).await;

        let done = worker(&store, registry).process_next().await.unwrap().unwrap();
        assert_eq!(done.id, job.id);
        assert_eq!(done.state, JobState::Succeeded);
        assert_eq!(done.result, Some(serde_json::json!(42)));
        assert!(done.lease.is_none());
    }

    #[tokio::test]
    async fn test_failure_schedules_retry() {
        let store = InMemoryBackend::new();
        let registry = HandlerRegistry::new().register("fail", |_: ()| async {
            Err::<(), _>(JobError::retryable("nope"))
        });
        enqueue(&store, Invocation::unit("fail")).await;

        let job = worker(&store, registry).process_next().await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Scheduled);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.last_error.as_deref(), Some("nope"));
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let store = InMemoryBackend::new();
        let registry = HandlerRegistry::new().register("explode", |_: ()| async {
            if true {
                panic!("kaboom");
            }
            Ok::<_, JobError>(())
        });
        enqueue(&store, Invocation::unit("explode")).await;

        let job = worker(&store, registry).process_next().await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Scheduled);
        assert_eq!(job.last_error.as_deref(), Some("handler panicked: kaboom"));
    }

    #[tokio::test]
    async fn test_unknown_handler_exhausts_immediately() {
        let store = InMemoryBackend::new();
        enqueue(&store, Invocation::unit("missing")).await;

        let job = worker(&store, HandlerRegistry::new())
            .process_next()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.state, JobState::FailedExhausted);
        assert_eq!(job.retry_count, 1);
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_lease_alive() {
        let store = InMemoryBackend::new();
        let registry = HandlerRegistry::new().register("slow", |_: ()| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, JobError>(())
        });
        let job = enqueue(&store, Invocation::unit("slow")).await;
        let config = WorkerConfig::builder()
            .lease_duration(Duration::from_millis(50))
            .heartbeat_interval(Duration::from_millis(10))
            .retry_policy(RetryPolicy::no_retries())
            .build();
        let worker = Worker::new(
            0,
            "test-pool",
            store.clone(),
            Arc::new(registry),
            Arc::new(config),
            Signals::default(),
        );

        let run = tokio::spawn(async move { worker.process_next().await });
        tokio::time::sleep(Duration::from_millis(120)).await;

        // Well past the original 50ms lease, yet still held.
        let running = store.fetch(&job.id).await.unwrap();
        assert_eq!(running.state, JobState::Processing);
        assert!(running.lease.unwrap().expires_at > Utc::now());

        let done = run.await.unwrap().unwrap().unwrap();
        assert_eq!(done.state, JobState::Succeeded);
    }

    #[tokio::test]
    async fn test_deleted_while_running_is_not_resurrected() {
        let store = InMemoryBackend::new();
        let lifecycle = Lifecycle::new(store.clone());
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let started_tx = Arc::new(std::sync::Mutex::new(Some(started_tx)));
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));

        let registry = HandlerRegistry::new().register("wait", move |_: ()| {
            let started_tx = started_tx.clone();
            let release_rx = release_rx.clone();
            async move {
                let tx = started_tx.lock().unwrap().take();
                if let Some(tx) = tx {
                    let _ = tx.send(());
                }
                if let Some(rx) = release_rx.lock().await.take() {
                    let _ = rx.await;
                }
                Ok::<_, JobError>(())
            }
        });
        let job = enqueue(&store, Invocation::unit("wait")).await;
        let worker = worker(&store, registry);

        let run = tokio::spawn(async move { worker.process_next().await });
        started_rx.await.unwrap();
        lifecycle.delete(&job.id, Utc::now()).await.unwrap();
        release_tx.send(()).unwrap();

        let reported = run.await.unwrap().unwrap().unwrap();
        assert_eq!(reported.state, JobState::Deleted);
        assert_eq!(store.fetch(&job.id).await.unwrap().state, JobState::Deleted);
    }

    #[tokio::test]
    async fn test_report_survives_store_outage() {
        let store = FlakyBackend::new(InMemoryBackend::new());
        let registry = HandlerRegistry::new().register("ok", |_: ()| async { Ok::<_, JobError>(()) });
        let job = enqueue(&store, Invocation::unit("ok")).await;
        store.fail_next("update_state", 2);

        let done = worker(&store, registry).process_next().await.unwrap().unwrap();
        assert_eq!(done.id, job.id);
        assert_eq!(done.state, JobState::Succeeded);
    }

    #[tokio::test]
    async fn test_report_gives_up_after_repeated_outages() {
        let store = FlakyBackend::new(InMemoryBackend::new());
        let registry = HandlerRegistry::new().register("ok", |_: ()| async { Ok::<_, JobError>(()) });
        let job = enqueue(&store, Invocation::unit("ok")).await;
        store.fail_next("update_state", 10);

        let err = worker(&store, registry).process_next().await.unwrap_err();
        assert!(err.is_transient());
        // Still leased; the reaper recovers it once the lease lapses.
        assert_eq!(store.fetch(&job.id).await.unwrap().state, JobState::Processing);
    }

    #[tokio::test]
    async fn test_continuations_settle_after_outage_during_report() {
        let store = FlakyBackend::new(InMemoryBackend::new());
        let registry = HandlerRegistry::new().register("ok", |_: ()| async { Ok::<_, JobError>(()) });
        let parent = enqueue(&store, Invocation::unit("ok")).await;
        let child = Job::awaiting(
            Invocation::unit("after"),
            JobOptions::default(),
            parent.id.clone(),
            ContinuationCondition::OnSuccess,
            Utc::now(),
        );
        store.create(&child).await.unwrap();
        // The parent's move lands, then listing its children fails once.
        store.fail_next("continuations", 1);

        let done = worker(&store, registry).process_next().await.unwrap().unwrap();
        assert_eq!(done.state, JobState::Succeeded);
        assert_eq!(store.fetch(&child.id).await.unwrap().state, JobState::Enqueued);
    }
}
