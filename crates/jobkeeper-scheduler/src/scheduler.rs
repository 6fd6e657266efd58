use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use jobkeeper_core::config::SchedulerConfig;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    error::{ExecutionError, Result, SchedulerError},
    executor::{ExecutionResult, JobExecutor},
    leader::LeaderState,
    repository::JobRepository,
    trigger::Trigger,
    types::{Job, JobDescription, JobStatus, JobStatusEvent},
};

/// Slack past a job's deadline before its execution counts as lost.
pub const STALL_GRACE: Duration = Duration::from_secs(30);

/// Accepts job registrations on every instance and, while this instance
/// leads, dispatches due jobs to their recipients.
///
/// Cheap to clone; clones share the repository, executor and worker pool.
#[derive(Clone)]
pub struct JobScheduler {
    repo: Arc<dyn JobRepository>,
    executor: Arc<dyn JobExecutor>,
    config: Arc<SchedulerConfig>,
    /// Bounds concurrently executing jobs across every tick.
    workers: Arc<Semaphore>,
    leader: watch::Receiver<LeaderState>,
    /// If set, status changes are sent here while this instance leads.
    status_tx: Option<mpsc::Sender<JobStatusEvent>>,
}

impl JobScheduler {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        executor: Arc<dyn JobExecutor>,
        config: SchedulerConfig,
        leader: watch::Receiver<LeaderState>,
    ) -> Self {
        Self {
            repo,
            executor,
            workers: Arc::new(Semaphore::new(config.max_workers.max(1))),
            config: Arc::new(config),
            leader,
            status_tx: None,
        }
    }

    /// Forward status changes to `tx`. The sender is non-blocking
    /// (`try_send`) so dispatch never waits on a slow consumer.
    pub fn with_status_sink(mut self, tx: mpsc::Sender<JobStatusEvent>) -> Self {
        self.status_tx = Some(tx);
        self
    }

    pub fn is_leader(&self) -> bool {
        *self.leader.borrow() == LeaderState::Leader
    }

    /// Validate and persist a new job. Every broken rule is reported at once.
    pub async fn schedule(&self, description: JobDescription) -> Result<Job> {
        let now = Utc::now();
        let job = self.validate(description, now)?;

        // a terminal record may be replaced; a live one wins the race
        let insert = |current: Option<Job>| match current {
            Some(existing) if !existing.status.is_terminal() => None,
            _ => Some(job.clone()),
        };
        let Some(job) = self.repo.update_job(&job.id, &insert).await? else {
            return Err(SchedulerError::JobExists { id: job.id });
        };
        info!(
            job_id = %job.id,
            correlation_id = %job.correlation_id,
            due_at = ?job.due_at(),
            "job scheduled"
        );
        self.emit(&job);
        Ok(job)
    }

    pub async fn get(&self, id: &str) -> Result<Job> {
        self.repo
            .get_job(id)
            .await?
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })
    }

    /// Cancel a job that has not reached a terminal status.
    ///
    /// Canceling a terminal job is a no-op that returns the record unchanged.
    /// The write is conditional, so a cancel racing a completing dispatch
    /// resolves to whichever reached the store first.
    pub async fn cancel(&self, id: &str) -> Result<Job> {
        let now = Utc::now();
        let cancel = |current: Option<Job>| {
            current
                .filter(|job| !job.status.is_terminal())
                .map(|job| job.with_status(JobStatus::Canceled, now))
        };
        match self.repo.update_job(id, &cancel).await? {
            Some(job) => {
                info!(job_id = %id, "job canceled");
                self.emit(&job);
                Ok(job)
            }
            None => self.get(id).await,
        }
    }

    /// Replace the trigger of a waiting or failed job and schedule it afresh.
    ///
    /// This is the manual way out of `ERROR`. The remaining retry budget is
    /// kept as is.
    pub async fn reschedule(&self, id: &str, trigger: Trigger) -> Result<Job> {
        let mut errors = Vec::new();
        trigger.validate(&mut errors);
        if trigger.has_next_fire_time().is_none() {
            errors.push("trigger has no fire time".to_string());
        }
        if !errors.is_empty() {
            return Err(SchedulerError::Validation(errors));
        }

        let now = Utc::now();
        let scheduled_id = Uuid::new_v4().to_string();
        let replace = |current: Option<Job>| {
            current
                .filter(|job| {
                    matches!(
                        job.status,
                        JobStatus::Scheduled | JobStatus::Retry | JobStatus::Error
                    )
                })
                .map(|job| Job {
                    trigger: trigger.clone(),
                    scheduled_id: Some(scheduled_id.clone()),
                    retry_at: None,
                    last_error: None,
                    ..job.with_status(JobStatus::Scheduled, now)
                })
        };
        match self.repo.update_job(id, &replace).await? {
            Some(job) => {
                info!(job_id = %id, due_at = ?job.due_at(), "job rescheduled");
                self.emit(&job);
                Ok(job)
            }
            None => {
                let current = self.get(id).await?;
                Err(SchedulerError::InvalidTransition {
                    id: id.to_string(),
                    status: current.status,
                })
            }
        }
    }

    /// One dispatch pass: claim every due job a free worker can take and
    /// hand it to the executor.
    ///
    /// Does nothing unless this instance leads. Executions that outlived
    /// their deadline are first put back in line. When the worker pool is
    /// saturated the remaining due jobs wait for a later tick. Returns the
    /// handles of the spawned dispatches; dropping them detaches the tasks.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<JoinHandle<()>>> {
        if !self.is_leader() {
            return Ok(Vec::new());
        }

        if let Err(e) = self.reclaim_stalled(now).await {
            error!("stalled job reclaim failed: {e}");
        }

        let due = self
            .repo
            .find_due(&JobStatus::DISPATCHABLE, None, now, self.config.batch_size)
            .await?;

        let mut handles = Vec::with_capacity(due.len());
        for job in due {
            let Ok(permit) = Arc::clone(&self.workers).try_acquire_owned() else {
                debug!(pending = ?job.id, "worker pool saturated; deferring to next tick");
                break;
            };

            let prior = job.status;
            let claimed = match self.claim(&job.id, now).await {
                Ok(Some(claimed)) => claimed,
                Ok(None) => continue, // canceled or taken since the query
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "failed to claim job");
                    continue;
                }
            };
            self.emit(&claimed);

            let this = self.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                this.dispatch(claimed, prior).await;
            }));
        }
        Ok(handles)
    }

    /// Return jobs left `EXECUTING` by a previous leader to `RETRY` so they
    /// are delivered again. Called when this instance gains leadership.
    ///
    /// Pages through every executing job, not only the first batch.
    pub async fn recover_stale(&self, now: DateTime<Utc>) -> Result<usize> {
        let page = self.config.batch_size.max(1);
        let mut recovered = 0;
        loop {
            let stale = self
                .repo
                .find_due(&[JobStatus::Executing], None, now, page)
                .await?;
            let full = stale.len() == page;
            let n = self.requeue(stale, now, |_| true).await;
            recovered += n;
            // a page nothing could be taken from would come back unchanged
            if !full || n == 0 {
                break;
            }
        }
        if recovered > 0 {
            warn!(count = recovered, "re-queued jobs left executing by a previous leader");
        }
        Ok(recovered)
    }

    /// Return to `RETRY` executing jobs whose last write is older than their
    /// deadline plus [`STALL_GRACE`].
    ///
    /// A dispatch always records an outcome once its deadline passes, so such
    /// a job lost its completion write and would otherwise stay `EXECUTING`
    /// for as long as this instance leads.
    pub async fn reclaim_stalled(&self, now: DateTime<Utc>) -> Result<usize> {
        let limit = self
            .config
            .batch_size
            .saturating_add(self.config.max_workers)
            .max(1);
        let executing = self
            .repo
            .find_due(&[JobStatus::Executing], None, now, limit)
            .await?;
        let reclaimed = self
            .requeue(executing, now, |job| self.is_stalled(job, now))
            .await;
        if reclaimed > 0 {
            warn!(count = reclaimed, "re-queued executions that outlived their deadline");
        }
        Ok(reclaimed)
    }

    /// Main loop. Ticks every `tick_interval_ms` while leading, until
    /// `shutdown` broadcasts `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("job scheduler started");
        let mut leader = self.leader.clone();
        if self.is_leader() {
            self.recover_on_promotion().await;
        }

        let period = Duration::from_millis(self.config.tick_interval_ms.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!("scheduler tick error: {e}");
                    }
                }
                changed = leader.changed() => {
                    if changed.is_err() {
                        warn!("leader elector gone; scheduler stopping");
                        break;
                    }
                    let state = *leader.borrow_and_update();
                    info!(%state, "leadership changed");
                    if state == LeaderState::Leader {
                        self.recover_on_promotion().await;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("job scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    // --- private helpers ---------------------------------------------------

    fn validate(&self, description: JobDescription, now: DateTime<Utc>) -> Result<Job> {
        let mut errors = Vec::new();
        if description.id.trim().is_empty() {
            errors.push("id must not be empty".to_string());
        }
        if description.correlation_id.trim().is_empty() {
            errors.push("correlationId must not be empty".to_string());
        }
        match &description.trigger {
            None => errors.push("trigger is required".to_string()),
            Some(trigger) => {
                trigger.validate(&mut errors);
                if trigger.has_next_fire_time().is_none() {
                    errors.push("trigger has no fire time".to_string());
                }
            }
        }
        match &description.recipient {
            None => errors.push("recipient is required".to_string()),
            Some(recipient) => recipient.validate(&mut errors),
        }
        if description.retries.is_some_and(|r| r < 0) {
            errors.push("retries must not be negative".to_string());
        }
        if description.execution_timeout.is_some_and(|t| t < 0) {
            errors.push("executionTimeout must not be negative".to_string());
        }

        let (Some(trigger), Some(recipient), true) =
            (description.trigger, description.recipient, errors.is_empty())
        else {
            return Err(SchedulerError::Validation(errors));
        };

        let retries = match description.retries {
            Some(r) => u32::try_from(r).unwrap_or(u32::MAX),
            None => self.config.max_retries,
        };
        Ok(Job {
            id: description.id,
            correlation_id: description.correlation_id,
            status: JobStatus::Scheduled,
            last_update: now,
            retries,
            priority: description.priority,
            execution_counter: 0,
            scheduled_id: Some(Uuid::new_v4().to_string()),
            recipient,
            trigger,
            execution_timeout: description.execution_timeout.map(|t| t.unsigned_abs()),
            execution_timeout_unit: description.execution_timeout_unit,
            retry_at: None,
            last_error: None,
        })
    }

    fn is_stalled(&self, job: &Job, now: DateTime<Utc>) -> bool {
        let deadline = job
            .execution_timeout()
            .unwrap_or(Duration::from_millis(self.config.default_execution_timeout_ms))
            .saturating_add(STALL_GRACE);
        let budget = TimeDelta::from_std(deadline).unwrap_or(TimeDelta::MAX);
        job.last_update
            .checked_add_signed(budget)
            .is_some_and(|limit| limit < now)
    }

    /// Conditionally move each still-`EXECUTING` job accepted by `stalled`
    /// to `RETRY`. Returns how many were written.
    async fn requeue<F>(&self, jobs: Vec<Job>, now: DateTime<Utc>, stalled: F) -> usize
    where
        F: Fn(&Job) -> bool + Send + Sync,
    {
        let reset = |current: Option<Job>| {
            current
                .filter(|job| job.status == JobStatus::Executing && stalled(job))
                .map(|job| job.with_status(JobStatus::Retry, now))
        };
        let mut requeued = 0;
        for job in jobs {
            match self.repo.update_job(&job.id, &reset).await {
                Ok(Some(job)) => {
                    requeued += 1;
                    self.emit(&job);
                }
                Ok(None) => {}
                Err(e) => error!(job_id = %job.id, error = %e, "failed to re-queue job"),
            }
        }
        requeued
    }

    /// Move a due job to `EXECUTING`, counting the attempt. `None` when the
    /// job is no longer dispatchable.
    async fn claim(&self, id: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        let claim = |current: Option<Job>| {
            current
                .filter(|job| job.status.is_dispatchable() && job.due_at().is_some_and(|at| at <= now))
                .map(|job| Job {
                    execution_counter: job.execution_counter.saturating_add(1),
                    ..job.with_status(JobStatus::Executing, now)
                })
        };
        self.repo.update_job(id, &claim).await
    }

    /// Execute one claimed job and record the outcome.
    ///
    /// The executor runs in its own task under the job's deadline. On expiry
    /// the task is aborted, dropping the in-flight request. A panicking
    /// executor is unexpected: the job goes back to `prior` untouched.
    async fn dispatch(&self, job: Job, prior: JobStatus) {
        let timeout = job
            .execution_timeout()
            .unwrap_or(Duration::from_millis(self.config.default_execution_timeout_ms));

        info!(
            job_id = %job.id,
            attempt = job.execution_counter,
            url = %job.recipient.url(),
            "executing job"
        );

        let executor = Arc::clone(&self.executor);
        let call_job = job.clone();
        let mut call = tokio::spawn(async move { executor.execute(&call_job).await });

        let result = match tokio::time::timeout(timeout, &mut call).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) if e.is_panic() => {
                error!(job_id = %job.id, error = %e, "executor panicked; job left for a later tick");
                self.restore(&job.id, prior).await;
                return;
            }
            Ok(Err(e)) => ExecutionResult::Failure(ExecutionError::Interrupted(e.to_string())),
            Err(_) => {
                call.abort();
                warn!(job_id = %job.id, timeout_ms = timeout.as_millis() as u64, "job execution timed out");
                ExecutionResult::Failure(ExecutionError::Timeout {
                    ms: timeout.as_millis() as u64,
                })
            }
        };

        self.complete(&job.id, result, Utc::now()).await;
    }

    /// Persist the outcome of a dispatch, but only if nothing else (such as
    /// a cancel) changed the job while it was executing.
    async fn complete(&self, id: &str, result: ExecutionResult, now: DateTime<Utc>) {
        let retry_interval = TimeDelta::milliseconds(
            i64::try_from(self.config.retry_interval_ms).unwrap_or(i64::MAX / 1_000_000),
        );
        let apply = |current: Option<Job>| {
            current
                .filter(|job| job.status == JobStatus::Executing)
                .map(|job| apply_result(job, &result, now, retry_interval))
        };

        match self.repo.update_job(id, &apply).await {
            Ok(Some(job)) => {
                match (job.status, &job.last_error) {
                    (JobStatus::Error, Some(reason)) => {
                        error!(job_id = %id, %reason, "job failed with no retries left")
                    }
                    (JobStatus::Retry, Some(reason)) => {
                        warn!(job_id = %id, retries_left = job.retries, %reason, "job failed; will retry")
                    }
                    (status, _) => info!(job_id = %id, %status, due_at = ?job.due_at(), "job executed"),
                }
                self.emit(&job);
            }
            Ok(None) => info!(job_id = %id, "job changed while executing; outcome discarded"),
            Err(e) => error!(job_id = %id, error = %e, "failed to record job outcome"),
        }
    }

    async fn restore(&self, id: &str, prior: JobStatus) {
        let now = Utc::now();
        let revert = |current: Option<Job>| {
            current
                .filter(|job| job.status == JobStatus::Executing)
                .map(|job| job.with_status(prior, now))
        };
        if let Err(e) = self.repo.update_job(id, &revert).await {
            error!(job_id = %id, error = %e, "failed to restore job status");
        }
    }

    async fn recover_on_promotion(&self) {
        if let Err(e) = self.recover_stale(Utc::now()).await {
            error!("stale job recovery failed: {e}");
        }
    }

    /// Outbound status messaging is a leader-only duty.
    fn emit(&self, job: &Job) {
        let Some(ref tx) = self.status_tx else {
            return;
        };
        if !self.is_leader() {
            return;
        }
        if tx.try_send(JobStatusEvent::from(job)).is_err() {
            warn!(job_id = %job.id, "status channel full or closed; event dropped");
        }
    }
}

/// New record for an `EXECUTING` job after its dispatch returned `result`.
///
/// Success advances the trigger: a further fire goes back to `SCHEDULED`,
/// an exhausted trigger ends in `EXECUTED`. Failure spends one retry and
/// becomes due again after `retry_interval`, or ends in `ERROR` once the
/// budget is gone. The trigger is left alone on failure so retries do not
/// shift the schedule.
pub fn apply_result(
    job: Job,
    result: &ExecutionResult,
    now: DateTime<Utc>,
    retry_interval: TimeDelta,
) -> Job {
    match result {
        ExecutionResult::Success { .. } => {
            let (trigger, next) = job.trigger.clone().advance();
            let status = if next.is_some() {
                JobStatus::Scheduled
            } else {
                JobStatus::Executed
            };
            Job {
                trigger,
                retry_at: None,
                last_error: None,
                ..job.with_status(status, now)
            }
        }
        ExecutionResult::Failure(err) if job.retries > 0 => Job {
            retries: job.retries - 1,
            retry_at: now.checked_add_signed(retry_interval),
            last_error: Some(err.to_string()),
            ..job.with_status(JobStatus::Retry, now)
        },
        ExecutionResult::Failure(err) => Job {
            retry_at: None,
            last_error: Some(err.to_string()),
            ..job.with_status(JobStatus::Error, now)
        },
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::recipient::Recipient;
    use crate::types::TimeUnit;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 3, 4, 5, 6).unwrap()
    }

    fn executing(trigger: Trigger, retries: u32) -> Job {
        Job {
            id: "job".to_string(),
            correlation_id: "corr".to_string(),
            status: JobStatus::Executing,
            last_update: t0(),
            retries,
            priority: 0,
            execution_counter: 1,
            scheduled_id: None,
            recipient: Recipient::http("http://localhost:1/cb"),
            trigger,
            execution_timeout: None,
            execution_timeout_unit: None,
            retry_at: None,
            last_error: None,
        }
    }

    fn failure() -> ExecutionResult {
        ExecutionResult::Failure(ExecutionError::Status {
            code: 500,
            body: "boom".to_string(),
        })
    }

    #[test]
    fn success_with_next_fire_goes_back_to_scheduled() {
        let job = executing(Trigger::simple(t0(), 1, TimeUnit::Hours, 2), 1);
        let next = apply_result(job, &ExecutionResult::Success { code: 200 }, t0(), TimeDelta::seconds(1));
        assert_eq!(next.status, JobStatus::Scheduled);
        assert_eq!(next.due_at(), Some(t0() + TimeDelta::hours(1)));
        assert_eq!(next.retries, 1);
    }

    #[test]
    fn success_on_last_fire_is_executed() {
        let job = executing(Trigger::at(t0()), 1);
        let next = apply_result(job, &ExecutionResult::Success { code: 204 }, t0(), TimeDelta::seconds(1));
        assert_eq!(next.status, JobStatus::Executed);
        assert_eq!(next.due_at(), None);
    }

    #[test]
    fn failure_spends_a_retry_without_moving_the_trigger() {
        let trigger = Trigger::simple(t0(), 1, TimeUnit::Hours, 2);
        let job = executing(trigger.clone(), 1);
        let later = t0() + TimeDelta::seconds(30);
        let next = apply_result(job, &failure(), later, TimeDelta::seconds(1));

        assert_eq!(next.status, JobStatus::Retry);
        assert_eq!(next.retries, 0);
        assert_eq!(next.trigger, trigger);
        assert_eq!(next.due_at(), Some(later + TimeDelta::seconds(1)));
        assert!(next.last_error.unwrap().contains("500"));
    }

    #[test]
    fn failure_without_retries_is_an_error() {
        let job = executing(Trigger::at(t0()), 0);
        let next = apply_result(job, &failure(), t0(), TimeDelta::seconds(1));
        assert_eq!(next.status, JobStatus::Error);
        assert_eq!(next.retry_at, None);
        assert!(next.last_error.is_some());
    }

    #[test]
    fn success_after_retry_resumes_the_original_schedule() {
        let job = executing(Trigger::simple(t0(), 1, TimeUnit::Hours, 2), 2);
        let retried = apply_result(job, &failure(), t0(), TimeDelta::seconds(1));
        let done = apply_result(
            Job {
                status: JobStatus::Executing,
                ..retried
            },
            &ExecutionResult::Success { code: 200 },
            t0() + TimeDelta::seconds(2),
            TimeDelta::seconds(1),
        );
        assert_eq!(done.retry_at, None);
        assert_eq!(done.due_at(), Some(t0() + TimeDelta::hours(1)));
    }
}
