// Dispatch lifecycle against the in-memory repository with a scripted executor.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use jobkeeper_core::config::SchedulerConfig;
use jobkeeper_scheduler::{
    ExecutionError, ExecutionResult, Job, JobDescription, JobExecutor, JobRepository,
    JobScheduler, JobStatus, LeaderState, LeaseRecord, MemoryJobRepository, Recipient,
    SchedulerError, TimeUnit, Trigger,
};
use jobkeeper_scheduler::repository::Update;
use tokio::sync::{mpsc, watch, Notify};

#[derive(Default)]
struct ScriptedExecutor {
    script: Mutex<VecDeque<ExecutionResult>>,
    calls: Mutex<Vec<String>>,
    gate: Option<Arc<Notify>>,
    delay: Option<Duration>,
    panics: bool,
}

impl ScriptedExecutor {
    fn answering(results: impl IntoIterator<Item = ExecutionResult>) -> Self {
        Self {
            script: Mutex::new(results.into_iter().collect()),
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobExecutor for ScriptedExecutor {
    async fn execute(&self, job: &Job) -> ExecutionResult {
        self.calls.lock().unwrap().push(job.id.clone());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.panics {
            panic!("executor blew up");
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ExecutionResult::Success { code: 200 })
    }
}

/// Memory repository that can fail one job write or yield before each call,
/// letting concurrent callers interleave.
#[derive(Default)]
struct FlakyRepository {
    inner: MemoryJobRepository,
    updates: AtomicUsize,
    /// 1-based index of the `update_job` call that errors.
    fail_update: Option<usize>,
    yields: bool,
}

impl FlakyRepository {
    async fn pause(&self) {
        if self.yields {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl JobRepository for FlakyRepository {
    async fn get_job(&self, id: &str) -> jobkeeper_scheduler::Result<Option<Job>> {
        let job = self.inner.get_job(id).await;
        self.pause().await;
        job
    }

    async fn save_job(&self, job: &Job) -> jobkeeper_scheduler::Result<()> {
        self.pause().await;
        self.inner.save_job(job).await
    }

    async fn update_job(
        &self,
        id: &str,
        update: Update<'_, Job>,
    ) -> jobkeeper_scheduler::Result<Option<Job>> {
        self.pause().await;
        let call = self.updates.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_update == Some(call) {
            return Err(SchedulerError::Repository("disk went away".to_string()));
        }
        self.inner.update_job(id, update).await
    }

    async fn delete_job(&self, id: &str) -> jobkeeper_scheduler::Result<bool> {
        self.inner.delete_job(id).await
    }

    async fn find_due(
        &self,
        statuses: &[JobStatus],
        from: Option<DateTime<Utc>>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> jobkeeper_scheduler::Result<Vec<Job>> {
        self.inner.find_due(statuses, from, to, limit).await
    }

    async fn get_lease(&self, id: &str) -> jobkeeper_scheduler::Result<Option<LeaseRecord>> {
        self.inner.get_lease(id).await
    }

    async fn get_and_update_lease(
        &self,
        id: &str,
        update: Update<'_, LeaseRecord>,
    ) -> jobkeeper_scheduler::Result<Option<LeaseRecord>> {
        self.inner.get_and_update_lease(id, update).await
    }
}

fn leading_scheduler(
    repo: Arc<FlakyRepository>,
) -> (JobScheduler, watch::Sender<LeaderState>) {
    let (leader, rx) = watch::channel(LeaderState::Leader);
    let scheduler = JobScheduler::new(repo, Arc::new(ScriptedExecutor::default()), config(), rx);
    (scheduler, leader)
}

struct Harness {
    scheduler: JobScheduler,
    repo: Arc<MemoryJobRepository>,
    executor: Arc<ScriptedExecutor>,
    leader: watch::Sender<LeaderState>,
}

fn harness(executor: ScriptedExecutor, config: SchedulerConfig) -> Harness {
    let repo = Arc::new(MemoryJobRepository::new());
    let executor = Arc::new(executor);
    let (leader, rx) = watch::channel(LeaderState::Leader);
    let scheduler = JobScheduler::new(repo.clone(), executor.clone(), config, rx);
    Harness {
        scheduler,
        repo,
        executor,
        leader,
    }
}

fn config() -> SchedulerConfig {
    SchedulerConfig {
        retry_interval_ms: 10,
        default_execution_timeout_ms: 2_000,
        ..Default::default()
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
}

fn describe(id: &str, trigger: Trigger) -> JobDescription {
    JobDescription {
        id: id.to_string(),
        correlation_id: format!("corr-{id}"),
        trigger: Some(trigger),
        recipient: Some(Recipient::http("http://localhost:1/cb")),
        priority: 0,
        retries: None,
        execution_timeout: None,
        execution_timeout_unit: None,
    }
}

fn server_error() -> ExecutionResult {
    ExecutionResult::Failure(ExecutionError::Status {
        code: 500,
        body: "boom".to_string(),
    })
}

async fn tick_and_wait(scheduler: &JobScheduler, now: DateTime<Utc>) -> usize {
    let handles = scheduler.tick(now).await.unwrap();
    let n = handles.len();
    for handle in handles {
        handle.await.unwrap();
    }
    n
}

#[tokio::test]
async fn hourly_timer_fires_three_times_then_executes() {
    let h = harness(ScriptedExecutor::default(), config());
    h.scheduler
        .schedule(describe("hourly", Trigger::simple(t0(), 1, TimeUnit::Hours, 2)))
        .await
        .unwrap();

    for (hour, expected) in [
        (0, JobStatus::Scheduled),
        (1, JobStatus::Scheduled),
        (2, JobStatus::Executed),
    ] {
        let now = t0() + TimeDelta::hours(hour);
        assert_eq!(tick_and_wait(&h.scheduler, now).await, 1);
        assert_eq!(h.scheduler.get("hourly").await.unwrap().status, expected);
    }

    let job = h.scheduler.get("hourly").await.unwrap();
    assert_eq!(job.execution_counter, 3);
    assert_eq!(h.executor.calls().len(), 3);
    assert_eq!(tick_and_wait(&h.scheduler, t0() + TimeDelta::hours(5)).await, 0);
}

#[tokio::test]
async fn nothing_fires_before_its_time() {
    let h = harness(ScriptedExecutor::default(), config());
    h.scheduler
        .schedule(describe("later", Trigger::at(t0() + TimeDelta::minutes(5))))
        .await
        .unwrap();

    assert_eq!(tick_and_wait(&h.scheduler, t0()).await, 0);
    assert_eq!(
        h.scheduler.get("later").await.unwrap().status,
        JobStatus::Scheduled
    );
}

#[tokio::test]
async fn failures_spend_retries_then_end_in_error() {
    let h = harness(
        ScriptedExecutor::answering([server_error(), server_error()]),
        config(),
    );
    let mut desc = describe("flaky", Trigger::at(t0()));
    desc.retries = Some(1);
    h.scheduler.schedule(desc).await.unwrap();

    tick_and_wait(&h.scheduler, t0()).await;
    let job = h.scheduler.get("flaky").await.unwrap();
    assert_eq!(job.status, JobStatus::Retry);
    assert_eq!(job.retries, 0);
    assert!(job.last_error.as_deref().unwrap().contains("500"));

    tick_and_wait(&h.scheduler, Utc::now() + TimeDelta::seconds(1)).await;
    let job = h.scheduler.get("flaky").await.unwrap();
    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(job.execution_counter, 2);
}

#[tokio::test]
async fn retry_success_returns_to_the_original_schedule() {
    let h = harness(ScriptedExecutor::answering([server_error()]), config());
    h.scheduler
        .schedule(describe("resume", Trigger::simple(t0(), 1, TimeUnit::Hours, 1)))
        .await
        .unwrap();

    tick_and_wait(&h.scheduler, t0()).await;
    assert_eq!(
        h.scheduler.get("resume").await.unwrap().status,
        JobStatus::Retry
    );

    tick_and_wait(&h.scheduler, Utc::now() + TimeDelta::seconds(1)).await;
    let job = h.scheduler.get("resume").await.unwrap();
    assert_eq!(job.status, JobStatus::Scheduled);
    assert_eq!(job.due_at(), Some(t0() + TimeDelta::hours(1)));
    assert_eq!(job.last_error, None);
}

#[tokio::test]
async fn slow_recipient_times_out_into_retry() {
    let h = harness(
        ScriptedExecutor {
            delay: Some(Duration::from_millis(500)),
            ..Default::default()
        },
        config(),
    );
    let mut desc = describe("slow", Trigger::at(t0()));
    desc.execution_timeout = Some(20);
    desc.execution_timeout_unit = Some(TimeUnit::Milliseconds);
    h.scheduler.schedule(desc).await.unwrap();

    tick_and_wait(&h.scheduler, t0()).await;
    let job = h.scheduler.get("slow").await.unwrap();
    assert_eq!(job.status, JobStatus::Retry);
    assert!(job.last_error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn panicking_executor_leaves_job_dispatchable() {
    let h = harness(
        ScriptedExecutor {
            panics: true,
            ..Default::default()
        },
        config(),
    );
    h.scheduler
        .schedule(describe("boom", Trigger::at(t0())))
        .await
        .unwrap();

    tick_and_wait(&h.scheduler, t0()).await;
    let job = h.scheduler.get("boom").await.unwrap();
    assert_eq!(job.status, JobStatus::Scheduled);
    assert_eq!(job.execution_counter, 1);
    assert_eq!(job.last_error, None);
}

#[tokio::test]
async fn cancel_during_execution_wins() {
    let gate = Arc::new(Notify::new());
    let h = harness(
        ScriptedExecutor {
            gate: Some(gate.clone()),
            ..Default::default()
        },
        config(),
    );
    h.scheduler
        .schedule(describe("race", Trigger::at(t0())))
        .await
        .unwrap();

    let handles = h.scheduler.tick(t0()).await.unwrap();
    assert_eq!(
        h.scheduler.get("race").await.unwrap().status,
        JobStatus::Executing
    );
    let canceled = h.scheduler.cancel("race").await.unwrap();
    assert_eq!(canceled.status, JobStatus::Canceled);

    gate.notify_one();
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(
        h.scheduler.get("race").await.unwrap().status,
        JobStatus::Canceled
    );
}

#[tokio::test]
async fn saturated_pool_defers_remaining_jobs() {
    let gate = Arc::new(Notify::new());
    let h = harness(
        ScriptedExecutor {
            gate: Some(gate.clone()),
            ..Default::default()
        },
        SchedulerConfig {
            max_workers: 1,
            ..config()
        },
    );
    for id in ["first", "second"] {
        h.scheduler
            .schedule(describe(id, Trigger::at(t0())))
            .await
            .unwrap();
    }

    let handles = h.scheduler.tick(t0()).await.unwrap();
    assert_eq!(handles.len(), 1);
    assert!(h.scheduler.tick(t0()).await.unwrap().is_empty());

    gate.notify_one();
    for handle in handles {
        handle.await.unwrap();
    }

    let handles = h.scheduler.tick(t0()).await.unwrap();
    assert_eq!(handles.len(), 1);
    gate.notify_one();
    for handle in handles {
        handle.await.unwrap();
    }

    for id in ["first", "second"] {
        assert_eq!(
            h.scheduler.get(id).await.unwrap().status,
            JobStatus::Executed
        );
    }
}

#[tokio::test]
async fn followers_do_not_dispatch() {
    let h = harness(ScriptedExecutor::default(), config());
    h.leader.send_replace(LeaderState::Follower);
    h.scheduler
        .schedule(describe("idle", Trigger::at(t0())))
        .await
        .unwrap();

    assert!(h.scheduler.tick(t0()).await.unwrap().is_empty());
    assert!(h.executor.calls().is_empty());
    assert_eq!(
        h.scheduler.get("idle").await.unwrap().status,
        JobStatus::Scheduled
    );
}

#[tokio::test]
async fn status_events_are_sent_only_while_leading() {
    let (tx, mut rx) = mpsc::channel(16);
    let mut h = harness(ScriptedExecutor::default(), config());
    h.scheduler = h.scheduler.with_status_sink(tx);

    h.leader.send_replace(LeaderState::Follower);
    h.scheduler
        .schedule(describe("quiet", Trigger::at(t0())))
        .await
        .unwrap();
    assert!(rx.try_recv().is_err());

    h.leader.send_replace(LeaderState::Leader);
    h.scheduler
        .schedule(describe("loud", Trigger::at(t0() + TimeDelta::hours(1))))
        .await
        .unwrap();
    let event = rx.try_recv().unwrap();
    assert_eq!(event.job_id, "loud");
    assert_eq!(event.status, JobStatus::Scheduled);
    assert_eq!(event.correlation_id, "corr-loud");

    tick_and_wait(&h.scheduler, t0()).await;
    let statuses: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
        .map(|e| (e.job_id, e.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("quiet".to_string(), JobStatus::Executing),
            ("quiet".to_string(), JobStatus::Executed),
        ]
    );
}

#[tokio::test]
async fn invalid_description_reports_every_problem() {
    let h = harness(ScriptedExecutor::default(), config());
    let desc = JobDescription {
        id: String::new(),
        correlation_id: "c".to_string(),
        trigger: None,
        recipient: Some(Recipient::http("ftp://nowhere")),
        priority: 0,
        retries: Some(-1),
        execution_timeout: Some(-5),
        execution_timeout_unit: None,
    };

    match h.scheduler.schedule(desc).await {
        Err(SchedulerError::Validation(errors)) => assert!(errors.len() >= 5, "{errors:?}"),
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[tokio::test]
async fn duplicate_ids_are_rejected_until_terminal() {
    let h = harness(ScriptedExecutor::default(), config());
    let desc = describe("dup", Trigger::at(t0()));
    h.scheduler.schedule(desc.clone()).await.unwrap();

    let err = h.scheduler.schedule(desc.clone()).await.unwrap_err();
    assert_eq!(err.code(), "JOB_EXISTS");

    h.scheduler.cancel("dup").await.unwrap();
    let again = h.scheduler.schedule(desc).await.unwrap();
    assert_eq!(again.status, JobStatus::Scheduled);
    assert_eq!(again.execution_counter, 0);
}

#[tokio::test]
async fn cancel_is_a_no_op_on_terminal_jobs() {
    let h = harness(ScriptedExecutor::default(), config());
    h.scheduler
        .schedule(describe("done", Trigger::at(t0())))
        .await
        .unwrap();
    tick_and_wait(&h.scheduler, t0()).await;

    let job = h.scheduler.cancel("done").await.unwrap();
    assert_eq!(job.status, JobStatus::Executed);
    assert_eq!(
        h.scheduler.cancel("missing").await.unwrap_err().code(),
        "JOB_NOT_FOUND"
    );
}

#[tokio::test]
async fn reschedule_revives_failed_jobs_only() {
    let h = harness(ScriptedExecutor::answering([server_error()]), config());
    let mut desc = describe("revive", Trigger::at(t0()));
    desc.retries = Some(0);
    h.scheduler.schedule(desc).await.unwrap();
    tick_and_wait(&h.scheduler, t0()).await;
    assert_eq!(
        h.scheduler.get("revive").await.unwrap().status,
        JobStatus::Error
    );

    let next = t0() + TimeDelta::hours(3);
    let job = h
        .scheduler
        .reschedule("revive", Trigger::at(next))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Scheduled);
    assert_eq!(job.due_at(), Some(next));
    assert_eq!(job.last_error, None);

    h.scheduler.cancel("revive").await.unwrap();
    let err = h
        .scheduler
        .reschedule("revive", Trigger::at(next))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::InvalidTransition {
            status: JobStatus::Canceled,
            ..
        }
    ));
}

#[tokio::test]
async fn stale_executions_are_requeued() {
    let h = harness(ScriptedExecutor::default(), config());
    h.scheduler
        .schedule(describe("orphan", Trigger::at(t0())))
        .await
        .unwrap();
    h.repo
        .update_job("orphan", &|current: Option<Job>| {
            current.map(|job| job.with_status(JobStatus::Executing, t0()))
        })
        .await
        .unwrap();

    assert_eq!(h.scheduler.recover_stale(Utc::now()).await.unwrap(), 1);
    assert_eq!(
        h.scheduler.get("orphan").await.unwrap().status,
        JobStatus::Retry
    );

    tick_and_wait(&h.scheduler, Utc::now()).await;
    assert_eq!(
        h.scheduler.get("orphan").await.unwrap().status,
        JobStatus::Executed
    );
}

#[tokio::test]
async fn lost_completion_write_is_reclaimed_after_the_deadline() {
    // writes: schedule, claim, then the completion that fails
    let repo = Arc::new(FlakyRepository {
        fail_update: Some(3),
        ..Default::default()
    });
    let (scheduler, _leader) = leading_scheduler(repo);
    scheduler
        .schedule(describe("lost", Trigger::at(t0())))
        .await
        .unwrap();

    assert_eq!(tick_and_wait(&scheduler, t0()).await, 1);
    let job = scheduler.get("lost").await.unwrap();
    assert_eq!(job.status, JobStatus::Executing);
    assert_eq!(job.execution_counter, 1);

    // inside the 2s deadline plus grace nothing is touched
    assert_eq!(tick_and_wait(&scheduler, t0() + TimeDelta::seconds(10)).await, 0);
    assert_eq!(
        scheduler.get("lost").await.unwrap().status,
        JobStatus::Executing
    );

    assert_eq!(tick_and_wait(&scheduler, t0() + TimeDelta::hours(1)).await, 1);
    let job = scheduler.get("lost").await.unwrap();
    assert_eq!(job.status, JobStatus::Executed);
    assert_eq!(job.execution_counter, 2);
}

#[tokio::test]
async fn recovery_pages_past_one_batch() {
    let h = harness(
        ScriptedExecutor::default(),
        SchedulerConfig {
            batch_size: 2,
            ..config()
        },
    );
    for i in 0..5 {
        let id = format!("orphan-{i}");
        h.scheduler
            .schedule(describe(&id, Trigger::at(t0())))
            .await
            .unwrap();
        h.repo
            .update_job(&id, &|current: Option<Job>| {
                current.map(|job| job.with_status(JobStatus::Executing, t0()))
            })
            .await
            .unwrap();
    }

    assert_eq!(h.scheduler.recover_stale(Utc::now()).await.unwrap(), 5);
    for i in 0..5 {
        assert_eq!(
            h.scheduler.get(&format!("orphan-{i}")).await.unwrap().status,
            JobStatus::Retry
        );
    }
}

#[tokio::test]
async fn concurrent_registrations_of_one_id_admit_one() {
    let repo = Arc::new(FlakyRepository {
        yields: true,
        ..Default::default()
    });
    let (scheduler, _leader) = leading_scheduler(repo);
    let mut first = describe("dup", Trigger::at(t0()));
    first.correlation_id = "first".to_string();
    let mut second = describe("dup", Trigger::at(t0()));
    second.correlation_id = "second".to_string();

    let (a, b) = tokio::join!(scheduler.schedule(first), scheduler.schedule(second));
    let (winner, loser) = match (a, b) {
        (Ok(job), Err(err)) | (Err(err), Ok(job)) => (job, err),
        other => panic!("expected exactly one registration, got {other:?}"),
    };
    assert_eq!(loser.code(), "JOB_EXISTS");
    assert_eq!(
        scheduler.get("dup").await.unwrap().correlation_id,
        winner.correlation_id
    );
}

#[tokio::test]
async fn zero_tick_interval_still_runs_the_loop() {
    let h = harness(
        ScriptedExecutor::default(),
        SchedulerConfig {
            tick_interval_ms: 0,
            ..config()
        },
    );
    h.scheduler
        .schedule(describe("eager", Trigger::at(t0())))
        .await
        .unwrap();

    let (stop, shutdown) = watch::channel(false);
    let task = tokio::spawn(h.scheduler.clone().run(shutdown));
    for _ in 0..400 {
        if h.scheduler.get("eager").await.unwrap().status == JobStatus::Executed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    stop.send(true).unwrap();
    task.await.unwrap();
    assert_eq!(
        h.scheduler.get("eager").await.unwrap().status,
        JobStatus::Executed
    );
}
