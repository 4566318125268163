//! Recurring job definitions and schedule functions.
//!
//! A definition stores its schedule as an opaque expression plus a timezone
//! name. Turning that into the next due time is the job of a
//! [`ScheduleEvaluator`]; [`BuiltinSchedules`] covers fixed intervals and
//! minute/hour/day boundaries. Plug in any other evaluator (a cron library,
//! a business calendar) by implementing the trait or passing a closure.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{BacklogError, Result};
use crate::job::{Invocation, JobId};
use crate::retrier::RetryPolicy;

/// A named template that spawns a new job on every occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringJob {
    /// Unique name.
    pub name: String,
    /// Invocation copied into each spawned job.
    pub invocation: Invocation,
    /// Schedule expression understood by the evaluator.
    pub schedule: String,
    /// IANA timezone name the schedule is evaluated in.
    pub timezone: String,
    /// Queue for spawned jobs.
    pub queue: String,
    /// Retry policy for spawned jobs.
    pub retry: Option<RetryPolicy>,
    /// Next occurrence; `None` once the schedule has no more.
    pub next_due: Option<DateTime<Utc>>,
    /// Last occurrence that spawned a job.
    pub last_fired_at: Option<DateTime<Utc>>,
    /// Job spawned by the last occurrence.
    pub last_job_id: Option<JobId>,
    /// When the definition was first added.
    pub created_at: DateTime<Utc>,
    /// When the definition was last changed.
    pub updated_at: DateTime<Utc>,
}

impl RecurringJob {
    /// Parsed timezone.
    pub fn tz(&self) -> Result<Tz> {
        parse_timezone(&self.timezone)
    }

    /// Whether the definition has an occurrence due at or before `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_due.is_some_and(|due| due <= now)
    }
}

/// Parse an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| BacklogError::Schedule(format!("unknown timezone {:?}", name)))
}

/// Opaque next-occurrence function.
pub trait ScheduleEvaluator: Send + Sync {
    /// First occurrence of `expression` strictly after `after`, evaluated in
    /// `timezone`. `Ok(None)` means the schedule has ended.
    fn next_occurrence(
        &self,
        expression: &str,
        timezone: Tz,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>>;
}

impl<F> ScheduleEvaluator for F
where
    F: Fn(&str, Tz, DateTime<Utc>) -> Result<Option<DateTime<Utc>>> + Send + Sync,
{
    fn next_occurrence(
        &self,
        expression: &str,
        timezone: Tz,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        self(expression, timezone, after)
    }
}

/// Evaluator for the built-in expressions:
///
/// - `@minutely`, `@hourly`, `@daily`: next boundary in the timezone
/// - `@every <n><s|m|h|d>`: fixed interval after the previous occurrence
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinSchedules;

impl BuiltinSchedules {
    /// Every minute, on the minute.
    pub fn minutely() -> String {
        "@minutely".to_string()
    }

    /// Every hour, on the hour.
    pub fn hourly() -> String {
        "@hourly".to_string()
    }

    /// Every day at local midnight.
    pub fn daily() -> String {
        "@daily".to_string()
    }

    /// Fixed interval.
    pub fn every(interval: std::time::Duration) -> String {
        format!("@every {}s", interval.as_secs().max(1))
    }
}

impl ScheduleEvaluator for BuiltinSchedules {
    fn next_occurrence(
        &self,
        expression: &str,
        timezone: Tz,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let expression = expression.trim();
        let next = match expression {
            "@minutely" => next_boundary(after, timezone, Boundary::Minute),
            "@hourly" => next_boundary(after, timezone, Boundary::Hour),
            "@daily" | "@midnight" => next_boundary(after, timezone, Boundary::Day),
            _ => match expression.strip_prefix("@every") {
                Some(interval) => {
                    let interval = parse_interval(interval.trim())?;
                    after.checked_add_signed(interval).ok_or_else(|| {
                        BacklogError::Schedule(format!(
                            "{:?} overflows the next occurrence",
                            expression
                        ))
                    })?
                }
                None => {
                    return Err(BacklogError::Schedule(format!(
                        "unsupported schedule expression {:?}",
                        expression
                    )))
                }
            },
        };
        Ok(Some(next))
    }
}

#[derive(Clone, Copy)]
enum Boundary {
    Minute,
    Hour,
    Day,
}

/// Next minute/hour/day boundary strictly after `after`, in `tz`.
fn next_boundary(after: DateTime<Utc>, tz: Tz, boundary: Boundary) -> DateTime<Utc> {
    let local = after.with_timezone(&tz).naive_local();
    let date = local.date();
    let mut candidate: NaiveDateTime = match boundary {
        Boundary::Minute => at(date, local.hour(), local.minute()) + Duration::minutes(1),
        Boundary::Hour => at(date, local.hour(), 0) + Duration::hours(1),
        Boundary::Day => at(date, 0, 0) + Duration::days(1),
    };
    let step = match boundary {
        Boundary::Minute => Duration::minutes(1),
        Boundary::Hour => Duration::hours(1),
        Boundary::Day => Duration::days(1),
    };

    // Boundaries inside a DST gap do not exist locally; move on to the next.
    loop {
        if let Some(resolved) = tz.from_local_datetime(&candidate).earliest() {
            let utc = resolved.with_timezone(&Utc);
            if utc > after {
                return utc;
            }
        }
        candidate += step;
    }
}

fn at(date: NaiveDate, hour: u32, minute: u32) -> NaiveDateTime {
    date.and_hms_opt(hour, minute, 0)
        .unwrap_or_else(|| date.and_time(chrono::NaiveTime::MIN))
}

fn parse_interval(text: &str) -> Result<Duration> {
    let invalid = || BacklogError::Schedule(format!("invalid interval {:?}", text));
    let split = text.find(|c: char| !c.is_ascii_digit()).ok_or_else(invalid)?;
    let (amount, unit) = text.split_at(split);
    let amount: i64 = amount.parse().map_err(|_| invalid())?;
    if amount <= 0 {
        return Err(invalid());
    }
    let interval = match unit {
        "s" => Duration::try_seconds(amount),
        "m" => Duration::try_minutes(amount),
        "h" => Duration::try_hours(amount),
        "d" => Duration::try_days(amount),
        _ => return Err(invalid()),
    };
    interval.ok_or_else(|| BacklogError::Schedule(format!("interval {:?} out of range", text)))
}
