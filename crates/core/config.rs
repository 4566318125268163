//! Configuration types for the job engine.

use std::time::Duration;

use crate::job::DEFAULT_QUEUE;
use crate::retrier::RetryPolicy;

/// Configuration for the WorkerPool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// Queues to consume, highest priority first.
    pub queues: Vec<String>,
    /// Interval for the scheduler loop.
    pub scheduler_interval: Duration,
    /// Interval for the lease-expiry sweep.
    pub reaper_interval: Duration,
    /// Processing lease granted per claim.
    pub lease_duration: Duration,
    /// How often a running job's lease is extended.
    pub heartbeat_interval: Duration,
    /// First idle backoff when no job is ready.
    pub fetch_backoff_min: Duration,
    /// Cap on the idle backoff.
    pub fetch_backoff_max: Duration,
    /// Batch size for scheduler and reaper.
    pub batch_size: usize,
    /// Graceful shutdown timeout.
    pub shutdown_timeout: Duration,
    /// Retry policy for jobs whose submission and handler name none.
    pub retry_policy: Option<RetryPolicy>,
    /// Pool identifier; generated when unset.
    pub pool_id: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            queues: vec![DEFAULT_QUEUE.to_string()],
            scheduler_interval: Duration::from_secs(1),
            reaper_interval: Duration::from_secs(5),
            lease_duration: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(15),
            fetch_backoff_min: Duration::from_millis(100),
            fetch_backoff_max: Duration::from_secs(5),
            batch_size: 100,
            shutdown_timeout: Duration::from_secs(30),
            retry_policy: None,
            pool_id: None,
        }
    }
}

/// Builder for WorkerConfig.
#[derive(Debug, Default)]
pub struct WorkerConfigBuilder {
    config: WorkerConfig,
}

impl WorkerConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of workers.
    pub fn num_workers(mut self, num: usize) -> Self {
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

    /// Set the scheduler interval.
    pub fn scheduler_interval(mut self, interval: Duration) -> Self {
        self.config.scheduler_interval = interval;
        self
    }

    /// Set the reaper interval.
    pub fn reaper_interval(mut self, interval: Duration) -> Self {
        self.config.reaper_interval = interval;
        self
    }

    /// Set the processing lease duration.
    pub fn lease_duration(mut self, lease: Duration) -> Self {
        self.config.lease_duration = lease;
        self
    }

    /// Set the lease heartbeat interval.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Set the idle backoff bounds.
    pub fn fetch_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.config.fetch_backoff_min = min;
        self.config.fetch_backoff_max = max;
        self
    }

    /// Set the batch size for scheduler and reaper.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Set the pool-wide retry policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_policy = Some(policy);
        self
    }

    /// Set the pool identifier.
    pub fn pool_id(mut self, id: impl Into<String>) -> Self {
        self.config.pool_id = Some(id.into());
        self
    }

    /// Build the WorkerConfig.
    pub fn build(self) -> WorkerConfig {
        self.config
    }
}

impl WorkerConfig {
    /// Create a new builder.
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder::new()
    }

    /// Check the values make sense together.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::BacklogError;

        if self.num_workers == 0 {
            return Err(BacklogError::Config("num_workers must be at least 1".into()));
        }
        if self.queues.is_empty() {
            return Err(BacklogError::Config("at least one queue is required".into()));
        }
        if self.batch_size == 0 {
            return Err(BacklogError::Config("batch_size must be at least 1".into()));
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.lease_duration {
            return Err(BacklogError::Config(format!(
                "heartbeat_interval ({:?}) must be non-zero and shorter than lease_duration ({:?})",
                self.heartbeat_interval, self.lease_duration
            )));
        }
        if self.fetch_backoff_min.is_zero() || self.fetch_backoff_min > self.fetch_backoff_max {
            return Err(BacklogError::Config(
                "fetch backoff bounds must satisfy 0 < min <= max".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.num_workers, 4);
        assert_eq!(config.queues, vec!["default"]);
        assert_eq!(config.lease_duration, Duration::from_secs(60));
        assert!(config.retry_policy.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = WorkerConfig::builder()
            .num_workers(2)
            .queues(["critical", "default"])
            .lease_duration(Duration::from_secs(10))
            .heartbeat_interval(Duration::from_secs(2))
            .retry_policy(RetryPolicy::no_retries())
            .pool_id("pool-a")
            .build();
        assert_eq!(config.num_workers, 2);
        assert_eq!(config.queues, vec!["critical", "default"]);
        assert_eq!(config.pool_id.as_deref(), Some("pool-a"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let bad = [
            WorkerConfig::builder().num_workers(0).build(),
            WorkerConfig::builder().queues(Vec::<String>::new()).build(),
            WorkerConfig::builder()
                .heartbeat_interval(Duration::from_secs(60))
                .build(),
            WorkerConfig::builder()
                .fetch_backoff(Duration::from_secs(2), Duration::from_secs(1))
                .build(),
        ];
        for config in bad {
            assert!(config.validate().is_err(), "{config:?}");
        }
    }
}
