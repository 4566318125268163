//! Worker pool for processing jobs.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::task::JoinSet;

use crate::backend::{Backend, SharedBackend};
use crate::config::WorkerConfig;
use crate::error::{BacklogError, Result};
use crate::heartbeat::generate_pool_id;
use crate::reaper::Reaper;
use crate::recurring::{BuiltinSchedules, ScheduleEvaluator};
use crate::registry::HandlerRegistry;
use crate::retrier::RetryPolicy;
use crate::scheduler::Scheduler;
use crate::worker::{JobResult, Signals, Worker};

/// Builder for WorkerPool.
pub struct WorkerPoolBuilder {
    config: WorkerConfig,
    registry: HandlerRegistry,
    backend: Option<SharedBackend>,
    evaluator: Option<Arc<dyn ScheduleEvaluator>>,
}

impl Default for WorkerPoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerPoolBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: WorkerConfig::default(),
            registry: HandlerRegistry::new(),
            backend: None,
            evaluator: None,
        }
    }

    /// Set the backend.
    pub fn backend(mut self, backend: impl Backend + 'static) -> Self {
        self.backend = Some(SharedBackend::new(backend));
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the number of workers.
    pub fn workers(mut self, num: usize) -> Self {
        self.config.num_workers = num;
        self
    }

    /// Set the queues to consume, highest priority first.
    pub fn queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    /// Set the pool-wide retry policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_policy = Some(policy);
        self
    }

    /// Set the shutdown timeout.
    pub fn shutdown_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Use another schedule evaluator for recurring jobs.
    pub fn schedule_evaluator(mut self, evaluator: impl ScheduleEvaluator + 'static) -> Self {
        self.evaluator = Some(Arc::new(evaluator));
        self
    }

    /// Replace the handler table.
    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Register a job handler.
    pub fn handler<T, R, F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult<R>> + Send + 'static,
    {
        self.registry = self.registry.register(name, handler);
        self
    }

    /// Register a job handler with its own retry policy.
    pub fn handler_with_retry<T, R, F, Fut>(
        mut self,
        name: impl Into<String>,
        policy: RetryPolicy,
        handler: F,
    ) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult<R>> + Send + 'static,
    {
        self.registry = self.registry.register_with_retry(name, policy, handler);
        self
    }

    /// Build the WorkerPool with the configured backend.
    pub fn build(self) -> Result<WorkerPool<SharedBackend>> {
        let backend = self
            .backend
            .ok_or_else(|| BacklogError::Config("Backend is required".to_string()))?;
        WorkerPool::with_evaluator(
            self.config,
            self.registry,
            backend,
            self.evaluator.unwrap_or_else(|| Arc::new(BuiltinSchedules)),
        )
    }

    /// Build the WorkerPool with a custom backend.
    pub fn build_with_backend<B: Backend + Clone + 'static>(
        self,
        backend: B,
    ) -> Result<WorkerPool<B>> {
        WorkerPool::with_evaluator(
            self.config,
            self.registry,
            backend,
            self.evaluator.unwrap_or_else(|| Arc::new(BuiltinSchedules)),
        )
    }
}

/// Worker pool for processing jobs.
///
/// Runs `num_workers` workers plus a scheduler and a lease reaper against
/// one store. Several pools, in one process or many, can share a store.
pub struct WorkerPool<B = SharedBackend>
where
    B: Backend + Clone + 'static,
{
    config: Arc<WorkerConfig>,
    registry: Arc<HandlerRegistry>,
    evaluator: Arc<dyn ScheduleEvaluator>,
    backend: B,
    pool_id: String,
    signals: Signals,
}

impl WorkerPool<SharedBackend> {
    /// Create a new builder for WorkerPool.
    pub fn builder() -> WorkerPoolBuilder {
        WorkerPoolBuilder::new()
    }
}

impl<B: Backend + Clone + 'static> WorkerPool<B> {
    /// Create a new worker pool with the built-in schedule evaluator.
    pub fn new(config: WorkerConfig, registry: HandlerRegistry, backend: B) -> Result<Self> {
        Self::with_evaluator(config, registry, backend, Arc::new(BuiltinSchedules))
    }

    /// Create a new worker pool.
    ///
    /// Fails with `Config` if the configuration is inconsistent, no handler
    /// is registered, or some handler has no retry policy while the pool has
    /// no default either.
    pub fn with_evaluator(
        config: WorkerConfig,
        registry: HandlerRegistry,
        backend: B,
        evaluator: Arc<dyn ScheduleEvaluator>,
    ) -> Result<Self> {
        config.validate()?;
        if registry.is_empty() {
            return Err(BacklogError::Config(
                "At least one handler is required".to_string(),
            ));
        }
        if config.retry_policy.is_none() {
            let missing = registry.without_policy();
            if !missing.is_empty() {
                return Err(BacklogError::Config(format!(
                    "No retry policy for handlers {:?}; register one per handler or set a pool retry_policy",
                    missing
                )));
            }
        }

        let pool_id = config.pool_id.clone().unwrap_or_else(generate_pool_id);
        Ok(Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            evaluator,
            backend,
            pool_id,
            signals: Signals::default(),
        })
    }

    /// Get the pool ID.
    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    /// Get the configuration.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Worker `id` of this pool, for driving jobs by hand.
    pub fn worker(&self, id: usize) -> Worker<B> {
        Worker::new(
            id,
            &self.pool_id,
            self.backend.clone(),
            self.registry.clone(),
            self.config.clone(),
            self.signals.clone(),
        )
    }

    /// This pool's scheduler, for ticking by hand.
    pub fn scheduler(&self) -> Scheduler<B> {
        Scheduler::new(
            self.backend.clone(),
            self.evaluator.clone(),
            self.config.scheduler_interval,
            self.config.batch_size,
            self.signals.running.clone(),
        )
    }

    /// This pool's lease reaper, for ticking by hand.
    pub fn reaper(&self) -> Reaper<B> {
        Reaper::new(
            self.backend.clone(),
            self.registry.clone(),
            self.config.retry_policy.clone(),
            self.config.reaper_interval,
            self.config.lease_duration,
            self.config.batch_size,
            self.signals.running.clone(),
        )
    }

    /// Run the worker pool until Ctrl-C.
    pub async fn run(&self) -> Result<()> {
        self.run_until(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
    }

    /// Run the worker pool until the provided shutdown future completes.
    ///
    /// This will spawn worker tasks, the scheduler and the reaper, and block
    /// until `shutdown` resolves, then initiate graceful shutdown and wait
    /// for draining to complete.
    pub async fn run_until<S>(&self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        if self.signals.running.swap(true, Ordering::SeqCst) {
            return Err(BacklogError::WorkerPool(format!(
                "pool {} is already running",
                self.pool_id
            )));
        }
        self.signals.draining.store(false, Ordering::SeqCst);

        let mut tasks = JoinSet::new();

        let reaper = self.reaper();
        tasks.spawn(async move { reaper.run().await });

        let scheduler = self.scheduler();
        tasks.spawn(async move { scheduler.run().await });

        for worker_id in 0..self.config.num_workers {
            let worker = self.worker(worker_id);
            tasks.spawn(async move { worker.run().await });
        }

        tracing::info!(
            workers = self.config.num_workers,
            queues = ?self.config.queues,
            handlers = ?self.registry.names(),
            pool_id = %self.pool_id,
            "Worker pool started"
        );

        // Wait for shutdown signal/future
        shutdown.await;
        tracing::info!(pool_id = %self.pool_id, "Shutdown requested, draining...");

        self.shutdown().await;

        // Wait for all tasks to complete
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Err(e)) => tracing::error!(error = %e, "Task failed"),
                Err(e) => tracing::error!(error = %e, "Task panicked"),
                Ok(Ok(())) => {}
            }
        }

        tracing::info!(pool_id = %self.pool_id, "Worker pool stopped");
        Ok(())
    }

    /// Initiate graceful shutdown.
    ///
    /// Stops claiming new jobs and waits up to `shutdown_timeout` for
    /// in-progress jobs. Jobs still running after that keep their lease until
    /// it lapses and the reaper of a live pool re-enqueues them.
    pub async fn shutdown(&self) {
        // Enter draining mode - stop fetching new jobs
        self.signals.draining.store(true, Ordering::SeqCst);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;

        while self.signals.in_progress.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    in_progress = self.signals.in_progress.load(Ordering::SeqCst),
                    "Shutdown timeout reached, forcing stop"
                );
                break;
            }

            // Wait for notification or timeout
            tokio::select! {
                _ = self.signals.drain_notify.notified() => {}
                _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
            }
        }

        // Stop all loops
        self.signals.running.store(false, Ordering::SeqCst);
    }

    /// Get the number of in-progress jobs.
    pub fn in_progress_count(&self) -> usize {
        self.signals.in_progress.load(Ordering::SeqCst)
    }

    /// Check if the pool is draining.
    pub fn is_draining(&self) -> bool {
        self.signals.draining.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBackend;
    use crate::worker::JobError;
    use std::time::Duration;

    async fn noop(_: ()) -> JobResult {
        Ok(())
    }

    #[test]
    fn test_build_requires_backend() {
        let err = WorkerPool::builder()
            .retry_policy(RetryPolicy::no_retries())
            .handler("noop", noop)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, BacklogError::Config(_)));
    }

    #[test]
    fn test_build_requires_handlers() {
        let err = WorkerPool::builder()
            .backend(InMemoryBackend::new())
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, BacklogError::Config(_)));
    }

    #[test]
    fn test_build_requires_explicit_retry_policy() {
        let err = WorkerPool::builder()
            .backend(InMemoryBackend::new())
            .handler("noop", noop)
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("noop"));

        let ok = WorkerPool::builder()
            .backend(InMemoryBackend::new())
            .handler_with_retry("noop", RetryPolicy::fixed(3, Duration::from_secs(1)), noop)
            .build();
        assert!(ok.is_ok());
    }

    #[test]
    fn test_worker_owner_includes_pool_id() {
        let pool = WorkerPool::builder()
            .config(WorkerConfig::builder().pool_id("pool-a").build())
            .retry_policy(RetryPolicy::no_retries())
            .handler("noop", noop)
            .build_with_backend(InMemoryBackend::new())
            .unwrap();
        assert_eq!(pool.pool_id(), "pool-a");
        assert_eq!(pool.worker(3).owner(), "pool-a/3");
    }

    #[tokio::test]
    async fn test_run_until_drains_and_stops() {
        let store = InMemoryBackend::new();
        let pool = WorkerPool::builder()
            .config(
                WorkerConfig::builder()
                    .num_workers(2)
                    .scheduler_interval(Duration::from_millis(10))
                    .reaper_interval(Duration::from_millis(10))
                    .fetch_backoff(Duration::from_millis(5), Duration::from_millis(20))
                    .build(),
            )
            .retry_policy(RetryPolicy::no_retries())
            .handler("noop", noop)
            .handler("fail", |_: ()| async { Err::<(), _>(JobError::fatal("no")) })
            .build_with_backend(store.clone())
            .unwrap();

        let client = crate::client::Client::with_backend(store.clone());
        let ok = client
            .enqueue(crate::job::Invocation::unit("noop"))
            .await
            .unwrap();
        let bad = client
            .enqueue(crate::job::Invocation::unit("fail"))
            .await
            .unwrap();

        pool.run_until(tokio::time::sleep(Duration::from_millis(200)))
            .await
            .unwrap();

        assert!(pool.is_draining());
        assert_eq!(pool.in_progress_count(), 0);
        assert_eq!(
            store.fetch(&ok).await.unwrap().state,
            crate::job::JobState::Succeeded
        );
        assert_eq!(
            store.fetch(&bad).await.unwrap().state,
            crate::job::JobState::FailedExhausted
        );
    }
}
