//! SQLite store for the backlog job engine.
//!
//! Each job is one row: the full record as JSON plus the columns the store
//! queries on (state, queue, due time, lease expiry, parent). Every write is
//! a compare-and-swap on a per-row `version`, so any number of pools and
//! clients, in this process or others, can share one database file.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use backlog_sqlite::SqliteBackend;
//! use backlog_core::Client;
//!
//! #[tokio::main]
//! async fn main() -> backlog_core::Result<()> {
//!     let backend = SqliteBackend::new("sqlite:jobs.db", "myapp").await?;
//!     let client = Client::new(backend);
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use backlog_core::{
    lease_deadline, Backend, BacklogError, Expected, Job, JobEvent, JobId, JobState, RecurringJob,
    Result, StateChange,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

/// How long a connection waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite backend for job storage.
#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
    namespace: String,
}

/// Map a sqlx error, keeping busy/unreachable conditions retryable.
fn db_error(context: &str, e: sqlx::Error) -> BacklogError {
    let transient = match &e {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        // SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes.
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| matches!(code & 0xff, 5 | 6)),
        _ => false,
    };
    if transient {
        BacklogError::StorageUnavailable(format!("{}: {}", context, e))
    } else {
        BacklogError::Backend(format!("{}: {}", context, e))
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Queryable columns derived from a job record.
struct Columns {
    state: &'static str,
    due_at: Option<i64>,
    enqueued_at: Option<i64>,
    lease_expires_at: Option<i64>,
}

impl Columns {
    fn of(job: &Job) -> Self {
        Self {
            state: job.state.as_str(),
            due_at: match job.state {
                JobState::Scheduled => Some(millis(job.scheduled_at.unwrap_or(job.created_at))),
                _ => None,
            },
            enqueued_at: match job.state {
                JobState::Enqueued => Some(millis(job.enqueued_at.unwrap_or(job.created_at))),
                _ => None,
            },
            lease_expires_at: match (job.state, &job.lease) {
                (JobState::Processing, Some(lease)) => Some(millis(lease.expires_at)),
                _ => None,
            },
        }
    }
}

impl SqliteBackend {
    /// Create a new SQLite backend.
    ///
    /// The database_url should be in the format: `sqlite:path/to/db.sqlite` or `sqlite::memory:`.
    /// The file is created if it does not exist.
    pub async fn new(database_url: &str, namespace: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| BacklogError::Config(format!("Invalid SQLite url: {}", e)))?
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(1) // SQLite works best with single connection for writes
            .connect_with(options)
            .await
            .map_err(|e| db_error("Failed to connect to SQLite", e))?;

        Self::with_pool(pool, namespace).await
    }

    /// Create an in-memory SQLite backend (useful for testing).
    ///
    /// The single connection is never recycled, since the database lives
    /// only as long as it does.
    pub async fn in_memory(namespace: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| BacklogError::Config(format!("Invalid SQLite url: {}", e)))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| db_error("Failed to open in-memory SQLite", e))?;

        Self::with_pool(pool, namespace).await
    }

    /// Use an existing pool. Tables are created if missing.
    pub async fn with_pool(pool: SqlitePool, namespace: &str) -> Result<Self> {
        if namespace.is_empty() || !namespace.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(BacklogError::Config(format!(
                "namespace must be non-empty ASCII alphanumerics or '_', got {:?}",
                namespace
            )));
        }

        let backend = Self {
            pool,
            namespace: namespace.to_string(),
        };
        backend.init_tables().await?;
        Ok(backend)
    }

    /// Initialize the required tables.
    async fn init_tables(&self) -> Result<()> {
        let jobs_table = self.jobs_table();
        let recurring_table = self.recurring_table();

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                queue TEXT NOT NULL,
                state TEXT NOT NULL,
                parent_id TEXT,
                due_at INTEGER,
                enqueued_at INTEGER,
                lease_expires_at INTEGER,
                created_at INTEGER NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                job_json TEXT NOT NULL
            )
            "#,
            jobs_table
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to create jobs table", e))?;

        let indexes = [
            ("ready", "state, queue, enqueued_at, seq"),
            ("due", "state, due_at"),
            ("lease", "state, lease_expires_at"),
            ("parent", "parent_id"),
            ("listing", "state, created_at, id"),
        ];
        for (name, columns) in indexes {
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{}_{} ON {} ({})",
                self.namespace, name, jobs_table, columns
            ))
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to create index", e))?;
        }

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                name TEXT PRIMARY KEY,
                next_due INTEGER,
                definition_json TEXT NOT NULL
            )
            "#,
            recurring_table
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to create recurring table", e))?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{}_next_due ON {} (next_due)",
            self.namespace, recurring_table
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to create index", e))?;

        Ok(())
    }

    fn jobs_table(&self) -> String {
        format!("{}_jobs", self.namespace)
    }

    fn recurring_table(&self) -> String {
        format!("{}_recurring", self.namespace)
    }

    /// Load a job with its row version.
    async fn load(&self, id: &JobId) -> Result<(Job, i64)> {
        let row: Option<(i64, String)> = sqlx::query_as(&format!(
            "SELECT version, job_json FROM {} WHERE id = ?",
            self.jobs_table()
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to fetch job", e))?;

        let (version, json) = row.ok_or_else(|| BacklogError::JobNotFound(id.to_string()))?;
        Ok((Job::from_json(&json)?, version))
    }

    /// Write `job` if the row is still at `version`. Returns whether it was.
    async fn swap(&self, job: &Job, version: i64) -> Result<bool> {
        let columns = Columns::of(job);
        let result = sqlx::query(&format!(
            r#"
            UPDATE {} SET
                queue = ?, state = ?, due_at = ?, enqueued_at = ?, lease_expires_at = ?,
                version = version + 1, job_json = ?
            WHERE id = ? AND version = ?
            "#,
            self.jobs_table()
        ))
        .bind(&job.queue)
        .bind(columns.state)
        .bind(columns.due_at)
        .bind(columns.enqueued_at)
        .bind(columns.lease_expires_at)
        .bind(job.to_json()?)
        .bind(job.id.to_string())
        .bind(version)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to update job", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn ids(&self, sql: &str, at: i64, limit: usize) -> Result<Vec<JobId>> {
        let rows: Vec<(String,)> = sqlx::query_as(sql)
            .bind(at)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("Failed to list jobs", e))?;

        rows.into_iter().map(|(id,)| JobId::from_str(&id)).collect()
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn create(&self, job: &Job) -> Result<()> {
        let columns = Columns::of(job);
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (id, queue, state, parent_id, due_at, enqueued_at,
                            lease_expires_at, created_at, job_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            self.jobs_table()
        ))
        .bind(job.id.to_string())
        .bind(&job.queue)
        .bind(columns.state)
        .bind(job.parent_id.as_ref().map(|p| p.to_string()))
        .bind(columns.due_at)
        .bind(columns.enqueued_at)
        .bind(columns.lease_expires_at)
        .bind(millis(job.created_at))
        .bind(job.to_json()?)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                BacklogError::DuplicateJob(job.id.to_string())
            }
            _ => db_error("Failed to create job", e),
        })?;
        Ok(())
    }

    async fn fetch(&self, id: &JobId) -> Result<Job> {
        self.load(id).await.map(|(job, _)| job)
    }

    async fn try_claim(
        &self,
        queues: &[String],
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<Job>> {
        let event = JobEvent::Claim {
            owner: owner.to_string(),
            lease_until: lease_deadline(now, lease),
        };

        for queue in queues {
            // Losing a race means another claimer took the head; look again.
            loop {
                let head: Option<(i64, String)> = sqlx::query_as(&format!(
                    r#"
                    SELECT version, job_json FROM {}
                    WHERE state = 'enqueued' AND queue = ?
                    ORDER BY enqueued_at, seq
                    LIMIT 1
                    "#,
                    self.jobs_table()
                ))
                .bind(queue)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| db_error("Failed to select job", e))?;

                let Some((version, json)) = head else {
                    break;
                };

                let mut job = Job::from_json(&json)?;
                StateChange::new(job.state, &event, now)?.apply(&mut job);
                if self.swap(&job, version).await? {
                    return Ok(Some(job));
                }
            }
        }
        Ok(None)
    }

    async fn update_state(
        &self,
        id: &JobId,
        expected: &Expected,
        change: &StateChange,
    ) -> Result<Job> {
        let (mut job, version) = self.load(id).await?;
        expected.check(&job)?;
        if change.transition.from != job.state {
            return Err(BacklogError::InvalidTransition {
                from: job.state,
                event: format!("change computed for {}", change.transition.from),
            });
        }

        change.apply(&mut job);
        if !self.swap(&job, version).await? {
            return Err(BacklogError::Conflict(format!(
                "job {} changed concurrently",
                id
            )));
        }
        Ok(job)
    }

    async fn extend_lease(&self, id: &JobId, owner: &str, until: DateTime<Utc>) -> Result<()> {
        let (mut job, version) = self.load(id).await?;
        Expected::state(JobState::Processing)
            .owned_by(owner)
            .check(&job)?;
        if let Some(lease) = job.lease.as_mut() {
            lease.expires_at = until;
        }

        if !self.swap(&job, version).await? {
            return Err(BacklogError::Conflict(format!(
                "job {} changed while extending its lease",
                id
            )));
        }
        Ok(())
    }

    async fn list_due(&self, before: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>> {
        self.ids(
            &format!(
                "SELECT id FROM {} WHERE state = 'scheduled' AND due_at <= ? ORDER BY due_at, seq LIMIT ?",
                self.jobs_table()
            ),
            millis(before),
            limit,
        )
        .await
    }

    async fn list_expired_leases(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>> {
        self.ids(
            &format!(
                "SELECT id FROM {} WHERE state = 'processing' AND lease_expires_at <= ? ORDER BY lease_expires_at, seq LIMIT ?",
                self.jobs_table()
            ),
            millis(now),
            limit,
        )
        .await
    }

    async fn continuations(&self, parent: &JobId) -> Result<Vec<JobId>> {
        let rows: Vec<(String,)> = sqlx::query_as(&format!(
            "SELECT id FROM {} WHERE parent_id = ? ORDER BY seq",
            self.jobs_table()
        ))
        .bind(parent.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list continuations", e))?;

        rows.into_iter().map(|(id,)| JobId::from_str(&id)).collect()
    }

    async fn upsert_recurring(&self, definition: &RecurringJob) -> Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (name, next_due, definition_json) VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                next_due = excluded.next_due,
                definition_json = excluded.definition_json
            "#,
            self.recurring_table()
        ))
        .bind(&definition.name)
        .bind(definition.next_due.map(millis))
        .bind(serde_json::to_string(definition)?)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to save recurring job", e))?;
        Ok(())
    }

    async fn get_recurring(&self, name: &str) -> Result<Option<RecurringJob>> {
        let row: Option<(String,)> = sqlx::query_as(&format!(
            "SELECT definition_json FROM {} WHERE name = ?",
            self.recurring_table()
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get recurring job", e))?;

        Ok(row
            .map(|(json,)| serde_json::from_str(&json))
            .transpose()?)
    }

    async fn remove_recurring(&self, name: &str) -> Result<bool> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE name = ?",
            self.recurring_table()
        ))
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to remove recurring job", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_recurring(&self) -> Result<Vec<RecurringJob>> {
        let rows: Vec<(String,)> = sqlx::query_as(&format!(
            "SELECT definition_json FROM {} ORDER BY name",
            self.recurring_table()
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list recurring jobs", e))?;

        rows.into_iter()
            .map(|(json,)| serde_json::from_str(&json).map_err(BacklogError::from))
            .collect()
    }

    async fn list_due_recurring(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RecurringJob>> {
        let rows: Vec<(String,)> = sqlx::query_as(&format!(
            "SELECT definition_json FROM {} WHERE next_due IS NOT NULL AND next_due <= ? ORDER BY name LIMIT ?",
            self.recurring_table()
        ))
        .bind(millis(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list due recurring jobs", e))?;

        rows.into_iter()
            .map(|(json,)| serde_json::from_str(&json).map_err(BacklogError::from))
            .collect()
    }

    async fn advance_recurring(
        &self,
        name: &str,
        expected_due: DateTime<Utc>,
        next_due: Option<DateTime<Utc>>,
        job_id: &JobId,
    ) -> Result<()> {
        let row: Option<(String,)> = sqlx::query_as(&format!(
            "SELECT definition_json FROM {} WHERE name = ?",
            self.recurring_table()
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get recurring job", e))?;

        let Some((current,)) = row else {
            return Err(BacklogError::Conflict(format!(
                "recurring job {} was removed",
                name
            )));
        };
        let mut definition: RecurringJob = serde_json::from_str(&current)?;
        if definition.next_due != Some(expected_due) {
            return Err(BacklogError::Conflict(format!(
                "recurring job {} already advanced past {}",
                name, expected_due
            )));
        }
        definition.next_due = next_due;
        definition.last_fired_at = Some(expected_due);
        definition.last_job_id = Some(job_id.clone());

        // The stored JSON doubles as the version: any concurrent write changes it.
        let result = sqlx::query(&format!(
            "UPDATE {} SET next_due = ?, definition_json = ? WHERE name = ? AND definition_json = ?",
            self.recurring_table()
        ))
        .bind(next_due.map(millis))
        .bind(serde_json::to_string(&definition)?)
        .bind(name)
        .bind(&current)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to advance recurring job", e))?;

        if result.rows_affected() == 0 {
            return Err(BacklogError::Conflict(format!(
                "recurring job {} changed concurrently",
                name
            )));
        }
        Ok(())
    }

    async fn list_jobs(&self, state: JobState, limit: usize, offset: usize) -> Result<Vec<Job>> {
        let rows: Vec<(String,)> = sqlx::query_as(&format!(
            "SELECT job_json FROM {} WHERE state = ? ORDER BY created_at, id LIMIT ? OFFSET ?",
            self.jobs_table()
        ))
        .bind(state.as_str())
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list jobs", e))?;

        rows.into_iter()
            .map(|(json,)| Job::from_json(&json).map_err(BacklogError::from))
            .collect()
    }

    async fn count_jobs(&self, state: JobState) -> Result<usize> {
        let row: (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM {} WHERE state = ?",
            self.jobs_table()
        ))
        .bind(state.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to count jobs", e))?;
        Ok(row.0 as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backlog_core::{ContinuationCondition, Invocation, JobOptions, Lifecycle, RetryPolicy};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    fn queues(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn enqueued(queue: &str, at: DateTime<Utc>) -> Job {
        Job::enqueued(
            Invocation::unit("noop"),
            JobOptions::default().queue(queue),
            at,
        )
    }

    async fn backend() -> SqliteBackend {
        SqliteBackend::in_memory("test").await.unwrap()
    }

    #[tokio::test]
    async fn test_rejects_bad_namespace() {
        let err = SqliteBackend::in_memory("bad-name; DROP").await.err().unwrap();
        assert!(matches!(err, BacklogError::Config(_)));
    }

    #[tokio::test]
    async fn test_create_fetch_and_duplicate() {
        let store = backend().await;
        let job = enqueued("default", t0());
        store.create(&job).await.unwrap();
        assert_eq!(store.fetch(&job.id).await.unwrap(), job);

        let err = store.create(&job).await.unwrap_err();
        assert!(matches!(err, BacklogError::DuplicateJob(_)));

        let missing = store.fetch(&JobId(uuid::Uuid::new_v4())).await.unwrap_err();
        assert!(matches!(missing, BacklogError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn test_claim_order_and_queue_priority() {
        let store = backend().await;
        let late = enqueued("default", t0() + secs(5));
        let early = enqueued("default", t0());
        let urgent = enqueued("critical", t0() + secs(10));
        store.create(&late).await.unwrap();
        store.create(&early).await.unwrap();
        store.create(&urgent).await.unwrap();

        let q = queues(&["critical", "default"]);
        let lease = Duration::from_secs(30);
        let mut claimed = Vec::new();
        while let Some(job) = store.try_claim(&q, "w1", t0(), lease).await.unwrap() {
            assert_eq!(job.state, JobState::Processing);
            assert!(job.is_leased_by("w1"));
            claimed.push(job.id);
        }
        assert_eq!(claimed, vec![urgent.id, early.id, late.id]);
    }

    #[tokio::test]
    async fn test_update_state_is_compare_and_swap() {
        let store = backend().await;
        let job = enqueued("default", t0());
        store.create(&job).await.unwrap();
        store
            .try_claim(&queues(&["default"]), "w1", t0(), Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let change = StateChange::new(
            JobState::Processing,
            &JobEvent::Succeed { result: None },
            t0() + secs(1),
        )
        .unwrap();

        let stale = Expected::state(JobState::Processing).owned_by("w2");
        let err = store.update_state(&job.id, &stale, &change).await.unwrap_err();
        assert!(err.is_conflict());

        let owner = Expected::state(JobState::Processing).owned_by("w1");
        let done = store.update_state(&job.id, &owner, &change).await.unwrap();
        assert_eq!(done.state, JobState::Succeeded);
        assert!(store.update_state(&job.id, &owner, &change).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_due_and_expired_lease_listing() {
        let store = backend().await;
        let soon = Job::scheduled(Invocation::unit("a"), JobOptions::default(), t0() + secs(5), t0());
        let later = Job::scheduled(Invocation::unit("b"), JobOptions::default(), t0() + secs(60), t0());
        store.create(&later).await.unwrap();
        store.create(&soon).await.unwrap();

        assert_eq!(store.list_due(t0() + secs(10), 10).await.unwrap(), vec![soon.id.clone()]);
        assert_eq!(
            store.list_due(t0() + secs(60), 10).await.unwrap(),
            vec![soon.id, later.id]
        );

        let running = enqueued("default", t0());
        store.create(&running).await.unwrap();
        store
            .try_claim(&queues(&["default"]), "w1", t0(), Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert!(store.list_expired_leases(t0() + secs(29), 10).await.unwrap().is_empty());

        store.extend_lease(&running.id, "w1", t0() + secs(90)).await.unwrap();
        assert!(store.list_expired_leases(t0() + secs(60), 10).await.unwrap().is_empty());
        assert_eq!(
            store.list_expired_leases(t0() + secs(90), 10).await.unwrap(),
            vec![running.id.clone()]
        );
        assert!(store
            .extend_lease(&running.id, "w2", t0() + secs(120))
            .await
            .unwrap_err()
            .is_conflict());
    }

    #[tokio::test]
    async fn test_continuations_settle_through_lifecycle() {
        let store = backend().await;
        let lifecycle = Lifecycle::new(store.clone());
        let parent = enqueued("default", t0());
        store.create(&parent).await.unwrap();
        let child = Job::awaiting(
            Invocation::unit("child"),
            JobOptions::default(),
            parent.id.clone(),
            ContinuationCondition::OnSuccess,
            t0(),
        );
        store.create(&child).await.unwrap();
        assert_eq!(store.continuations(&parent.id).await.unwrap(), vec![child.id.clone()]);

        store
            .try_claim(&queues(&["default"]), "w1", t0(), Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        lifecycle
            .fail(&parent.id, "w1", "boom", false, &RetryPolicy::no_retries(), t0() + secs(1))
            .await
            .unwrap();

        assert_eq!(store.fetch(&parent.id).await.unwrap().state, JobState::FailedExhausted);
        assert_eq!(store.fetch(&child.id).await.unwrap().state, JobState::Deleted);
    }

    #[tokio::test]
    async fn test_recurring_crud_and_advance() {
        let store = backend().await;
        let definition = RecurringJob {
            name: "report".to_string(),
            invocation: Invocation::unit("report"),
            schedule: "@minutely".to_string(),
            timezone: "UTC".to_string(),
            queue: "default".to_string(),
            retry: None,
            next_due: Some(t0() + secs(60)),
            last_fired_at: None,
            last_job_id: None,
            created_at: t0(),
            updated_at: t0(),
        };
        store.upsert_recurring(&definition).await.unwrap();
        assert_eq!(store.get_recurring("report").await.unwrap(), Some(definition.clone()));
        assert!(store.list_due_recurring(t0(), 10).await.unwrap().is_empty());
        assert_eq!(store.list_due_recurring(t0() + secs(60), 10).await.unwrap().len(), 1);

        let job_id = JobId::for_occurrence("report", t0() + secs(60));
        store
            .advance_recurring("report", t0() + secs(60), Some(t0() + secs(120)), &job_id)
            .await
            .unwrap();
        let err = store
            .advance_recurring("report", t0() + secs(60), Some(t0() + secs(120)), &job_id)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let advanced = store.get_recurring("report").await.unwrap().unwrap();
        assert_eq!(advanced.next_due, Some(t0() + secs(120)));
        assert_eq!(advanced.last_fired_at, Some(t0() + secs(60)));
        assert_eq!(advanced.last_job_id, Some(job_id));
        assert_eq!(store.list_recurring().await.unwrap().len(), 1);

        assert!(store.remove_recurring("report").await.unwrap());
        assert!(!store.remove_recurring("report").await.unwrap());
        assert!(store.get_recurring("report").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_inspection_counts_and_pages() {
        let store = backend().await;
        let mut ids = Vec::new();
        for n in 0..5 {
            let job = enqueued("default", t0() + secs(n));
            ids.push(job.id.clone());
            store.create(&job).await.unwrap();
        }

        assert_eq!(store.count_jobs(JobState::Enqueued).await.unwrap(), 5);
        assert_eq!(store.count_jobs(JobState::Processing).await.unwrap(), 0);

        let page: Vec<JobId> = store
            .list_jobs(JobState::Enqueued, 2, 1)
            .await
            .unwrap()
            .into_iter()
            .map(|job| job.id)
            .collect();
        assert_eq!(page, ids[1..3].to_vec());
    }
}
