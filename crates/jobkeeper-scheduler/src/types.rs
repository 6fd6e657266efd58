use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::recipient::Recipient;
use crate::trigger::Trigger;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting for the trigger's next fire time.
    Scheduled,
    /// Waiting to re-attempt a delivery that failed.
    Retry,
    /// Claimed by the leader and handed to a recipient executor.
    Executing,
    /// Trigger exhausted after a successful delivery.
    Executed,
    Canceled,
    /// Retry budget exhausted. Needs a manual reschedule.
    Error,
}

impl JobStatus {
    /// Statuses the dispatch loop picks up.
    pub const DISPATCHABLE: [JobStatus; 2] = [JobStatus::Scheduled, JobStatus::Retry];

    /// Terminal jobs are never dispatched or canceled again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Executed | JobStatus::Canceled | JobStatus::Error
        )
    }

    pub fn is_dispatchable(self) -> bool {
        Self::DISPATCHABLE.contains(&self)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Scheduled => "SCHEDULED",
            JobStatus::Retry => "RETRY",
            JobStatus::Executing => "EXECUTING",
            JobStatus::Executed => "EXECUTED",
            JobStatus::Canceled => "CANCELED",
            JobStatus::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "SCHEDULED" => Ok(JobStatus::Scheduled),
            "RETRY" => Ok(JobStatus::Retry),
            "EXECUTING" => Ok(JobStatus::Executing),
            "EXECUTED" => Ok(JobStatus::Executed),
            "CANCELED" => Ok(JobStatus::Canceled),
            "ERROR" => Ok(JobStatus::Error),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Unit attached to periods and timeouts on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeUnit {
    #[default]
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    /// `amount` of this unit as a chrono delta. `None` on overflow.
    pub fn delta(self, amount: i64) -> Option<TimeDelta> {
        match self {
            TimeUnit::Milliseconds => TimeDelta::try_milliseconds(amount),
            TimeUnit::Seconds => TimeDelta::try_seconds(amount),
            TimeUnit::Minutes => TimeDelta::try_minutes(amount),
            TimeUnit::Hours => TimeDelta::try_hours(amount),
            TimeUnit::Days => TimeDelta::try_days(amount),
        }
    }

    pub fn to_millis(self, amount: u64) -> u64 {
        let factor = match self {
            TimeUnit::Milliseconds => 1,
            TimeUnit::Seconds => 1_000,
            TimeUnit::Minutes => 60_000,
            TimeUnit::Hours => 3_600_000,
            TimeUnit::Days => 86_400_000,
        };
        amount.saturating_mul(factor)
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    /// Caller-side identifier, echoed in status events.
    pub correlation_id: String,
    pub status: JobStatus,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_update: DateTime<Utc>,
    /// Remaining retry budget. Only ever decreases.
    pub retries: u32,
    #[serde(default)]
    pub priority: i32,
    /// Dispatch attempts so far, successful or not. Only ever increases.
    #[serde(default)]
    pub execution_counter: u32,
    /// Identifier of the current scheduling generation; replaced on reschedule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_id: Option<String>,
    pub recipient: Recipient,
    pub trigger: Trigger,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_timeout_unit: Option<TimeUnit>,
    /// When set, the job is due at this instant instead of the trigger's
    /// next fire time (a pending failure retry).
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub retry_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Job {
    /// Instant at which the job should next be dispatched, if any.
    pub fn due_at(&self) -> Option<DateTime<Utc>> {
        self.retry_at.or_else(|| self.trigger.has_next_fire_time())
    }

    /// Per-job execution deadline. Falls back to milliseconds when the unit is omitted.
    pub fn execution_timeout(&self) -> Option<std::time::Duration> {
        self.execution_timeout.map(|amount| {
            let unit = self.execution_timeout_unit.unwrap_or_default();
            std::time::Duration::from_millis(unit.to_millis(amount))
        })
    }

    pub fn with_status(self, status: JobStatus, now: DateTime<Utc>) -> Self {
        Self {
            status,
            last_update: now,
            ..self
        }
    }
}

/// What a client submits to [`crate::JobScheduler::schedule`].
///
/// Numeric fields are signed so that negative values reach validation
/// instead of failing deserialization with an opaque message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescription {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub correlation_id: String,
    pub trigger: Option<Trigger>,
    pub recipient: Option<Recipient>,
    #[serde(default)]
    pub priority: i32,
    /// Defaults to the configured `max_retries`.
    pub retries: Option<i64>,
    pub execution_timeout: Option<i64>,
    pub execution_timeout_unit: Option<TimeUnit>,
}

/// The single lease row arbitrating leadership for a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    pub id: String,
    pub token: Option<String>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl LeaseRecord {
    pub fn is_held_by(&self, token: &str) -> bool {
        self.token.as_deref() == Some(token)
    }

    /// True when nobody has renewed the lease within `expiration` of `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, expiration: TimeDelta) -> bool {
        match self.last_heartbeat {
            // an expiration reaching past the calendar never lapses
            Some(beat) => now
                .checked_sub_signed(expiration)
                .is_some_and(|cutoff| beat < cutoff),
            None => true,
        }
    }
}

/// Notification emitted after a job's status changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusEvent {
    pub job_id: String,
    pub correlation_id: String,
    pub status: JobStatus,
    pub execution_counter: u32,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_update: DateTime<Utc>,
}

impl From<&Job> for JobStatusEvent {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            correlation_id: job.correlation_id.clone(),
            status: job.status,
            execution_counter: job.execution_counter,
            last_update: job.last_update,
        }
    }
}
