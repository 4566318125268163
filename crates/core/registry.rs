//! Handler table: maps invocation names to code.
//!
//! Jobs carry only a handler name and JSON arguments. A worker resolves the
//! name here at execution time, so any process that registered the same
//! names can run any job.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::job::{Invocation, Job};
use crate::retrier::RetryPolicy;
use crate::worker::{JobError, JobResult};

/// Future produced by an erased handler.
pub(crate) type HandlerFuture =
    Pin<Box<dyn Future<Output = JobResult<Option<serde_json::Value>>> + Send>>;

type ErasedHandler =
    Arc<dyn Fn(serde_json::Value) -> Result<HandlerFuture, JobError> + Send + Sync>;

#[derive(Clone)]
struct Registration {
    handler: ErasedHandler,
    retry: Option<RetryPolicy>,
}

/// Named job handlers with their retry policies.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Registration>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`.
    ///
    /// The handler receives the invocation arguments decoded as `T`; its
    /// output is stored as the job result. Registering a name twice replaces
    /// the earlier handler.
    pub fn register<T, R, F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult<R>> + Send + 'static,
    {
        self.insert(name.into(), handler, None)
    }

    /// Register `handler` under `name` with its own retry policy.
    pub fn register_with_retry<T, R, F, Fut>(
        self,
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
        self.insert(name.into(), handler, Some(policy))
    }

    fn insert<T, R, F, Fut>(mut self, name: String, handler: F, retry: Option<RetryPolicy>) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult<R>> + Send + 'static,
    {
        let handler: ErasedHandler = Arc::new(move |args: serde_json::Value| {
            let payload: T = serde_json::from_value(args)
                .map_err(|e| JobError::fatal(format!("invalid arguments: {}", e)))?;
            let fut = handler(payload);
            Ok(Box::pin(async move {
                let output = fut.await?;
                let value = serde_json::to_value(output)
                    .map_err(|e| JobError::fatal(format!("unserializable result: {}", e)))?;
                Ok((!value.is_null()).then_some(value))
            }) as HandlerFuture)
        });
        self.handlers
            .insert(name, Registration { handler, retry });
        self
    }

    /// Whether a handler is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Retry policy registered with a handler.
    pub fn retry_policy(&self, name: &str) -> Option<&RetryPolicy> {
        self.handlers.get(name).and_then(|r| r.retry.as_ref())
    }

    /// Names of handlers registered without a retry policy.
    pub(crate) fn without_policy(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .iter()
            .filter(|(_, r)| r.retry.is_none())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Policy for a job: its own, then its handler's, then `fallback`.
    pub fn resolve_policy(&self, job: &Job, fallback: Option<&RetryPolicy>) -> Option<RetryPolicy> {
        job.retry
            .as_ref()
            .or_else(|| self.retry_policy(&job.invocation.handler))
            .or(fallback)
            .cloned()
    }

    /// Decode arguments and start the handler for `invocation`.
    ///
    /// An unknown name or undecodable arguments is a fatal error.
    pub(crate) fn prepare(&self, invocation: &Invocation) -> Result<HandlerFuture, JobError> {
        let registration = self.handlers.get(&invocation.handler).ok_or_else(|| {
            JobError::fatal(format!("no handler registered for {:?}", invocation.handler))
        })?;
        (registration.handler)(invocation.args.clone())
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}
