//! Basic demo on SQLite storage.
//!
//! This demo shows each kind of job the engine runs:
//! - A fire-and-forget job, run right away
//! - A delayed job, run two minutes after start
//! - A recurring job, run every minute in the local timezone
//! - A continuation, run after its parent succeeds
//! - A failing job, run 3 times (2 retries, 5 minutes apart), then exhausted
//!
//! The store is in memory unless `DATABASE_URL` points at a file
//! (`sqlite:backlog-demo.db`). The recurring schedule uses the IANA zone in
//! `TZ`, falling back to UTC.
//!
//! Run with: `cargo run -p demo-basic`

use backlog_client::AdminClient;
use backlog_core::{Client, Invocation, JobError, JobResult, RetryPolicy, WorkerPool};
use backlog_sqlite::SqliteBackend;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Message printed by the `print` handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Message {
    text: String,
}

impl Message {
    fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

async fn print_message(message: Message) -> JobResult {
    println!("{}", message.text);
    Ok(())
}

async fn coin_flip(_: ()) -> JobResult<u32> {
    let n: u32 = rand::thread_rng().gen_range(1..200);
    if n % 2 == 0 {
        println!("Recurring job rolled an even number ({})", n);
    } else {
        println!("Recurring job rolled an odd number ({})", n);
    }
    Ok(n)
}

async fn always_fails(_: ()) -> JobResult {
    Err(JobError::retryable("Something went wrong"))
}

fn local_timezone() -> String {
    std::env::var("TZ")
        .ok()
        .filter(|tz| backlog_core::parse_timezone(tz).is_ok())
        .unwrap_or_else(|| "UTC".to_string())
}

#[tokio::main]
async fn main() -> backlog_core::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let backend = match std::env::var("DATABASE_URL") {
        Ok(url) => SqliteBackend::new(&url, "demo").await?,
        Err(_) => SqliteBackend::in_memory("demo").await?,
    };
    let client = Client::new(backend.clone());
    let admin = AdminClient::new(backend.clone());

    // Fire-and-forget
    let id = client
        .enqueue(Invocation::new("print", &Message::new("Fire-and-forget job!"))?)
        .await?;
    tracing::info!(job_id = %id, "Enqueued fire-and-forget job");

    // Delayed
    let id = client
        .schedule(
            Invocation::new(
                "print",
                &Message::new("Delayed job, run 2 minutes after start"),
            )?,
            Duration::from_secs(120),
        )
        .await?;
    tracing::info!(job_id = %id, "Scheduled delayed job");

    // Recurring
    let timezone = local_timezone();
    client
        .add_or_update_recurring(
            "coin-flip",
            Invocation::unit("coin_flip"),
            "@minutely",
            &timezone,
        )
        .await?;
    tracing::info!(timezone = %timezone, "Registered recurring job");

    // Continuation
    let parent = client
        .enqueue(Invocation::new("print", &Message::new("Parent job!"))?)
        .await?;
    let child = client
        .continue_with(
            &parent,
            Invocation::new(
                "print",
                &Message::new(format!("Child job! (continuation of {})", parent)),
            )?,
            backlog_core::ContinuationCondition::OnSuccess,
        )
        .await?;
    tracing::info!(parent = %parent, job_id = %child, "Added continuation");

    // Failure
    let id = client.enqueue(Invocation::unit("always_fails")).await?;
    tracing::info!(job_id = %id, "Enqueued failing job");

    // Dashboard
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            ticker.tick().await;
            match admin.stats().await {
                Ok(stats) => tracing::info!(
                    scheduled = stats.scheduled,
                    enqueued = stats.enqueued,
                    processing = stats.processing,
                    succeeded = stats.succeeded,
                    failed_exhausted = stats.failed_exhausted,
                    recurring = stats.recurring,
                    "Job stats"
                ),
                Err(e) => tracing::warn!(error = %e, "Failed to read stats"),
            }
        }
    });

    let pool = WorkerPool::builder()
        .backend(backend)
        .workers(2)
        .retry_policy(RetryPolicy::fixed(3, Duration::from_secs(300)))
        .handler("print", print_message)
        .handler("coin_flip", coin_flip)
        .handler("always_fails", always_fails)
        .shutdown_timeout(Duration::from_secs(5))
        .build()?;

    tracing::info!(pool_id = %pool.pool_id(), "Starting worker pool, press Ctrl+C to stop");
    pool.run().await
}
