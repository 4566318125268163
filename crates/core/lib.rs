//! # backlog-core - Core types and engine for background jobs
//!
//! This crate provides the core of the backlog job engine:
//! - `Backend` trait for storage implementations, plus `InMemoryBackend`
//! - `Job`, `JobId`, `JobState`, `Invocation` and the pure state machine
//! - `Client` for submitting jobs, continuations and recurring definitions
//! - `WorkerPool` for processing jobs, with its `Scheduler` and `Reaper`
//! - `RetryPolicy` and error types

mod backend;
mod client;
mod config;
mod continuation;
mod error;
mod heartbeat;
mod job;
mod lifecycle;
mod memory;
mod pool;
mod reaper;
mod recurring;
mod registry;
mod retrier;
mod scheduler;
mod state;
#[cfg(test)]
mod testing;
mod worker;

// Re-export main types
pub use backend::{lease_deadline, Backend, DynBackend, SharedBackend};
pub use client::Client;
pub use config::{WorkerConfig, WorkerConfigBuilder};
pub use error::{BacklogError, Result};
pub use heartbeat::generate_pool_id;
pub use job::{
    ContinuationCondition, Invocation, Job, JobId, JobOptions, JobState, Lease, StateRecord,
    DEFAULT_QUEUE,
};
pub use lifecycle::Lifecycle;
pub use memory::InMemoryBackend;
pub use pool::{WorkerPool, WorkerPoolBuilder};
pub use reaper::{ReapReport, Reaper};
pub use recurring::{parse_timezone, BuiltinSchedules, RecurringJob, ScheduleEvaluator};
pub use registry::HandlerRegistry;
pub use retrier::{RetryDecision, RetryPolicy};
pub use scheduler::{Scheduler, TickReport};
pub use state::{transition, Expected, JobEvent, SideEffect, StateChange, Transition};
pub use worker::{JobError, JobResult, Worker};

// Timezone type used by schedule evaluators.
pub use chrono_tz::Tz;
