//! Priority- and delay-aware job queue with a bounded worker pool.
//!
//! A single coordinator mutex guards the job table, the ready/delayed
//! heaps, and the bounded history rings; it is never held across an
//! `.await`. Selection order at any instant: only jobs whose
//! `execute_not_before` has passed are eligible; among those the highest
//! priority wins, FIFO within a priority.
//!
//! Workers invoke the engine through the [`JobRunner`] contract under a
//! watchdog timeout. The engine owns transport retries; the queue's own
//! retry is a safety net that fires only when the attempt machinery
//! itself errors, never for the watchdog.

pub mod retry;

use std::{
    collections::{BinaryHeap, HashMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use async_trait::async_trait;
use herald_common::{Signal, tracing};
use herald_transport::DeliveryReceipt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Notify, broadcast};

use crate::{
    error::{ErrorInfo, ErrorKind},
    types::{Job, JobId, JobStatus, QueueStats},
};

/// Configuration for the job queue and its workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum concurrent attempts.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Idle worker wake-up interval.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Watchdog timeout for one attempt sequence.
    #[serde(default = "default_job_timeout_ms")]
    pub job_timeout_ms: u64,

    /// Base delay of the queue-level requeue schedule.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Interval of the stuck-job sweep.
    #[serde(default = "default_stuck_sweep_interval_ms")]
    pub stuck_sweep_interval_ms: u64,

    /// Queue-level safety-net retries per job. Zero disables the net.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Completed and failed jobs retained, each.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Age bound on retained history.
    #[serde(default = "default_history_max_age_ms")]
    pub history_max_age_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            job_timeout_ms: default_job_timeout_ms(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            stuck_sweep_interval_ms: default_stuck_sweep_interval_ms(),
            max_retries: default_max_retries(),
            history_limit: default_history_limit(),
            history_max_age_ms: default_history_max_age_ms(),
        }
    }
}

const fn default_max_concurrency() -> usize {
    5
}

const fn default_poll_interval_ms() -> u64 {
    1_000
}

const fn default_job_timeout_ms() -> u64 {
    90_000
}

const fn default_retry_base_delay_ms() -> u64 {
    5_000
}

const fn default_stuck_sweep_interval_ms() -> u64 {
    60_000
}

const fn default_max_retries() -> u32 {
    1
}

const fn default_history_limit() -> usize {
    100
}

const fn default_history_max_age_ms() -> u64 {
    86_400_000 // 24 hours
}

/// Terminal disposition of one engine attempt sequence.
#[derive(Debug, Clone)]
pub enum Disposition {
    Delivered(DeliveryReceipt),
    Rejected(ErrorInfo),
}

/// What one attempt sequence produced.
#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub disposition: Disposition,
    /// Transport attempts consumed by the sequence.
    pub attempts: u32,
}

/// Failure of the attempt machinery itself, not a transport outcome.
#[derive(Debug, Clone, Error)]
pub enum RunnerError {
    /// Shutdown interrupted the attempt; the job is requeued without
    /// consuming a safety-net retry.
    #[error("attempt interrupted by shutdown")]
    Interrupted,

    /// Unexpected internal error; eligible for the queue-level retry.
    #[error("internal attempt error: {0}")]
    Internal(String),
}

/// Contract between the queue's workers and the delivery engine.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Run the full attempt sequence for one job.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError`] only when the machinery itself fails;
    /// transport outcomes are reported inside the [`AttemptReport`].
    async fn run(&self, job: &Job) -> Result<AttemptReport, RunnerError>;

    /// Called when the queue fails a job on the engine's behalf (watchdog
    /// timeout or safety-net exhaustion), so the engine can record the
    /// terminal outcome.
    async fn on_job_failed(&self, job: &Job, error: &ErrorInfo) {
        let _ = (job, error);
    }
}

/// Ready-heap entry: highest priority first, FIFO within a priority.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyEntry {
    priority: u8,
    seq: u64,
    job_id: JobId,
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Delayed-heap entry, min-ordered by `execute_not_before`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DelayedEntry {
    at: Instant,
    seq: u64,
    job_id: JobId,
}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<JobId, Job>,
    ready: BinaryHeap<ReadyEntry>,
    delayed: BinaryHeap<DelayedEntry>,
    by_request: HashMap<String, JobId>,
    completed: VecDeque<Job>,
    failed: VecDeque<Job>,
    seq: u64,
    processing: usize,
    queue_retries_total: u64,
}

impl QueueState {
    /// Move delayed entries whose time has come onto the ready heap.
    fn promote(&mut self, now: Instant) {
        while let Some(entry) = self.delayed.peek() {
            if entry.at > now {
                break;
            }
            let Some(entry) = self.delayed.pop() else {
                break;
            };
            if let Some(job) = self.jobs.get(&entry.job_id) {
                self.ready.push(ReadyEntry {
                    priority: job.priority,
                    seq: entry.seq,
                    job_id: entry.job_id,
                });
            }
        }
    }

    /// Place a job on the ready or delayed heap per its
    /// `execute_not_before`.
    fn schedule(&mut self, job_id: JobId, now: Instant) {
        let Some(job) = self.jobs.get(&job_id) else {
            return;
        };
        let (priority, at) = (job.priority, job.execute_not_before);
        self.seq += 1;
        let seq = self.seq;

        if at <= now {
            self.ready.push(ReadyEntry {
                priority,
                seq,
                job_id,
            });
        } else {
            self.delayed.push(DelayedEntry { at, seq, job_id });
        }
    }

    /// Move a terminal job into its history ring, evicting past the limit.
    fn archive(&mut self, job: Job, limit: usize) {
        let ring = match job.status {
            JobStatus::Completed => &mut self.completed,
            _ => &mut self.failed,
        };
        ring.push_back(job);
        if ring.len() > limit {
            let evicted = ring.pop_front();
            if let Some(evicted) = evicted {
                if self.by_request.get(&evicted.request_id) == Some(&evicted.job_id) {
                    self.by_request.remove(&evicted.request_id);
                }
            }
        }
    }

    /// Drop history entries older than the retention age.
    fn prune_aged(&mut self, now: SystemTime, max_age: Duration) {
        let mut evicted_keys = Vec::new();
        for ring in [&mut self.completed, &mut self.failed] {
            while let Some(front) = ring.front() {
                let expired = front
                    .finished_at
                    .and_then(|at| now.duration_since(at).ok())
                    .is_some_and(|age| age > max_age);
                if !expired {
                    break;
                }
                if let Some(evicted) = ring.pop_front() {
                    evicted_keys.push((evicted.request_id, evicted.job_id));
                }
            }
        }
        for (request_id, job_id) in evicted_keys {
            if self.by_request.get(&request_id) == Some(&job_id) {
                self.by_request.remove(&request_id);
            }
        }
    }

    fn find(&self, job_id: JobId) -> Option<Job> {
        self.jobs.get(&job_id).cloned().or_else(|| {
            self.completed
                .iter()
                .rev()
                .chain(self.failed.iter().rev())
                .find(|job| job.job_id == job_id)
                .cloned()
        })
    }
}

/// The in-process job queue.
pub struct JobQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
    notify: Notify,
    shutdown: broadcast::Sender<Signal>,
}

impl JobQueue {
    #[must_use]
    pub fn new(config: QueueConfig, shutdown: broadcast::Sender<Signal>) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            shutdown,
        }
    }

    pub const fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Accept a new job. The caller has already deduplicated by request id.
    pub fn enqueue(&self, job: Job) -> JobId {
        let job_id = job.job_id;
        {
            let mut state = self.state.lock();
            state.by_request.insert(job.request_id.clone(), job_id);
            state.jobs.insert(job_id, job);
            state.schedule(job_id, Instant::now());
        }
        self.notify.notify_waiters();
        tracing::debug!(job_id = %job_id, "job enqueued");
        job_id
    }

    /// Snapshot of the most recent job for a request, active or archived.
    pub fn latest_job_for_request(&self, request_id: &str) -> Option<Job> {
        let state = self.state.lock();
        let job_id = state.by_request.get(request_id).copied()?;
        state.find(job_id)
    }

    /// Queue counters for admin queries.
    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        let queued = state
            .jobs
            .values()
            .filter(|job| matches!(job.status, JobStatus::Queued | JobStatus::Retrying))
            .count();
        QueueStats {
            queued,
            processing: state.processing,
            completed: state.completed.len(),
            failed: state.failed.len(),
            concurrency: self.config.max_concurrency,
            is_processing: state.processing > 0,
            queue_retries: state.queue_retries_total,
        }
    }

    /// Spawn the worker pool and the stuck-job sweeper.
    ///
    /// Shutdown receivers are subscribed here, before this returns, so a
    /// signal sent any time after `start` is observed by every task.
    pub fn start(self: &Arc<Self>, runner: Arc<dyn JobRunner>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.config.max_concurrency + 1);

        for worker in 0..self.config.max_concurrency {
            let queue = Arc::clone(self);
            let runner = Arc::clone(&runner);
            let shutdown = self.shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                queue.worker_loop(worker, runner, shutdown).await;
            }));
        }

        let queue = Arc::clone(self);
        let shutdown = self.shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            queue.sweeper_loop(runner, shutdown).await;
        }));

        handles
    }

    async fn worker_loop(
        &self,
        worker: usize,
        runner: Arc<dyn JobRunner>,
        mut shutdown: broadcast::Receiver<Signal>,
    ) {
        tracing::trace!(worker, "queue worker started");
        while let Some(job) = self.acquire(&mut shutdown).await {
            self.process(&job, runner.as_ref()).await;
        }
        tracing::trace!(worker, "queue worker stopped");
    }

    /// Take the next eligible job, or `None` on shutdown.
    async fn acquire(&self, shutdown: &mut broadcast::Receiver<Signal>) -> Option<Job> {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            let next_deadline = {
                let mut state = self.state.lock();
                let now = Instant::now();
                state.promote(now);

                if let Some(entry) = state.ready.pop() {
                    if let Some(job) = state.jobs.get_mut(&entry.job_id) {
                        job.status = JobStatus::Processing;
                        job.started_at = Some(now);
                        let snapshot = job.clone();
                        state.processing += 1;
                        return Some(snapshot);
                    }
                    // Stale entry for an archived job; look again.
                    continue;
                }

                state.delayed.peek().map(|entry| entry.at)
            };

            let sleep_for = next_deadline
                .map_or(poll_interval, |at| {
                    at.saturating_duration_since(Instant::now())
                })
                .min(poll_interval);

            tokio::select! {
                () = self.notify.notified() => {}
                () = tokio::time::sleep(sleep_for) => {}
                _ = shutdown.recv() => return None,
            }
        }
    }

    async fn process(&self, job: &Job, runner: &dyn JobRunner) {
        let timeout = Duration::from_millis(self.config.job_timeout_ms);

        match tokio::time::timeout(timeout, runner.run(job)).await {
            Ok(Ok(report)) => self.finish(job.job_id, report),
            Ok(Err(RunnerError::Interrupted)) => self.requeue_interrupted(job.job_id),
            Ok(Err(RunnerError::Internal(message))) => {
                self.safety_net_retry(job.job_id, message, runner).await;
            }
            Err(_elapsed) => {
                tracing::warn!(
                    job_id = %job.job_id,
                    request_id = %job.request_id,
                    timeout_ms = self.config.job_timeout_ms,
                    "watchdog timeout, failing job"
                );
                let error = ErrorInfo::watchdog_timeout();
                if let Some(failed) = self.fail_job(job.job_id, error.clone()) {
                    runner.on_job_failed(&failed, &error).await;
                }
            }
        }
    }

    /// Record the engine's terminal report and archive the job.
    fn finish(&self, job_id: JobId, report: AttemptReport) {
        let mut state = self.state.lock();
        let Some(mut job) = state.jobs.remove(&job_id) else {
            return;
        };
        if job.status == JobStatus::Processing {
            state.processing = state.processing.saturating_sub(1);
        }

        job.attempts = report.attempts;
        job.finished_at = Some(SystemTime::now());
        match report.disposition {
            Disposition::Delivered(receipt) => {
                job.status = JobStatus::Completed;
                job.result = Some(receipt);
            }
            Disposition::Rejected(error) => {
                job.status = JobStatus::Failed;
                job.last_error = Some(error);
            }
        }
        state.archive(job, self.config.history_limit);
    }

    /// Shutdown interrupted the attempt: put the job back without
    /// consuming a retry. Durability across restarts is out of scope, so
    /// degraded bookkeeping here is acceptable.
    fn requeue_interrupted(&self, job_id: JobId) {
        let mut state = self.state.lock();
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return;
        };
        job.status = JobStatus::Retrying;
        job.started_at = None;
        job.execute_not_before = Instant::now();
        state.processing = state.processing.saturating_sub(1);
        state.schedule(job_id, Instant::now());
    }

    /// Queue-level safety net for unexpected attempt errors.
    async fn safety_net_retry(&self, job_id: JobId, message: String, runner: &dyn JobRunner) {
        let can_retry = {
            let state = self.state.lock();
            match state.jobs.get(&job_id) {
                Some(job) => job.queue_retries < self.config.max_retries,
                None => return,
            }
        };

        if can_retry {
            let retries = {
                let mut state = self.state.lock();
                let Some(job) = state.jobs.get_mut(&job_id) else {
                    return;
                };
                job.queue_retries += 1;
                job.status = JobStatus::Retrying;
                job.started_at = None;
                job.execute_not_before = Instant::now()
                    + retry::requeue_delay(
                        job.queue_retries,
                        Duration::from_millis(self.config.retry_base_delay_ms),
                    );
                let retries = job.queue_retries;
                state.processing = state.processing.saturating_sub(1);
                state.queue_retries_total += 1;
                state.schedule(job_id, Instant::now());
                retries
            };
            tracing::warn!(
                job_id = %job_id,
                retries,
                error = %message,
                "unexpected attempt error, safety-net requeue"
            );
            self.notify.notify_waiters();
            return;
        }

        let error = ErrorInfo::new(ErrorKind::Exhausted, "ATTEMPT_ERROR", message);
        if let Some(failed) = self.fail_job(job_id, error.clone()) {
            tracing::error!(
                job_id = %job_id,
                error = %error,
                "safety-net retries exhausted, failing job"
            );
            runner.on_job_failed(&failed, &error).await;
        }
    }

    /// Force a job into the failed ring with the given error.
    fn fail_job(&self, job_id: JobId, error: ErrorInfo) -> Option<Job> {
        let mut state = self.state.lock();
        let mut job = state.jobs.remove(&job_id)?;
        if job.status == JobStatus::Processing {
            state.processing = state.processing.saturating_sub(1);
        }
        job.status = JobStatus::Failed;
        job.finished_at = Some(SystemTime::now());
        job.last_error = Some(error);
        state.archive(job.clone(), self.config.history_limit);
        Some(job)
    }

    /// Fail any processing job whose watchdog deadline passed without the
    /// worker reporting back, and prune aged history. Returns how many
    /// jobs were failed.
    pub async fn sweep_stuck(&self, now: Instant, runner: &dyn JobRunner) -> usize {
        let timeout = Duration::from_millis(self.config.job_timeout_ms);
        let stuck: Vec<JobId> = {
            let state = self.state.lock();
            state
                .jobs
                .values()
                .filter(|job| {
                    job.status == JobStatus::Processing
                        && job
                            .started_at
                            .is_some_and(|started| started + timeout < now)
                })
                .map(|job| job.job_id)
                .collect()
        };

        let mut failed = Vec::with_capacity(stuck.len());
        for job_id in stuck {
            let error = ErrorInfo::watchdog_timeout();
            if let Some(job) = self.fail_job(job_id, error) {
                tracing::warn!(job_id = %job_id, "stuck job failed by sweeper");
                failed.push(job);
            }
        }

        {
            let mut state = self.state.lock();
            state.prune_aged(
                SystemTime::now(),
                Duration::from_millis(self.config.history_max_age_ms),
            );
        }

        let count = failed.len();
        for job in failed {
            runner
                .on_job_failed(&job, &ErrorInfo::watchdog_timeout())
                .await;
        }
        count
    }

    async fn sweeper_loop(
        &self,
        runner: Arc<dyn JobRunner>,
        mut shutdown: broadcast::Receiver<Signal>,
    ) {
        let interval = Duration::from_millis(self.config.stuck_sweep_interval_ms);
        loop {
            tokio::select! {
                () = tokio::time::sleep(interval) => {
                    let failed = self.sweep_stuck(Instant::now(), runner.as_ref()).await;
                    if failed > 0 {
                        tracing::warn!(failed, "stuck-job sweep failed jobs");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use herald_common::MailPayload;

    use super::*;

    fn payload() -> MailPayload {
        MailPayload {
            to: "user@example.com".to_string(),
            subject: "s".to_string(),
            body: "b".to_string(),
        }
    }

    fn job(request_id: &str, priority: u8, delay_ms: u64) -> Job {
        Job::new(request_id.to_string(), payload(), priority, delay_ms)
    }

    fn fast_config() -> QueueConfig {
        QueueConfig {
            max_concurrency: 1,
            poll_interval_ms: 20,
            job_timeout_ms: 5_000,
            retry_base_delay_ms: 10,
            stuck_sweep_interval_ms: 60_000,
            max_retries: 1,
            history_limit: 100,
            history_max_age_ms: 86_400_000,
        }
    }

    /// What the stub runner should do for one request id.
    #[derive(Debug, Clone)]
    enum Step {
        Deliver,
        Reject(ErrorInfo),
        Error(String),
        Hang(Duration),
    }

    #[derive(Default)]
    struct StubRunner {
        steps: Mutex<HashMap<String, VecDeque<Step>>>,
        runs: Mutex<Vec<(String, Instant)>>,
        failed: Mutex<Vec<(String, ErrorInfo)>>,
    }

    impl StubRunner {
        fn script(&self, request_id: &str, steps: Vec<Step>) {
            self.steps
                .lock()
                .insert(request_id.to_string(), steps.into());
        }

        fn run_order(&self) -> Vec<String> {
            self.runs.lock().iter().map(|(id, _)| id.clone()).collect()
        }

        fn run_instants(&self, request_id: &str) -> Vec<Instant> {
            self.runs
                .lock()
                .iter()
                .filter(|(id, _)| id == request_id)
                .map(|(_, at)| *at)
                .collect()
        }
    }

    #[async_trait]
    impl JobRunner for StubRunner {
        async fn run(&self, job: &Job) -> Result<AttemptReport, RunnerError> {
            self.runs
                .lock()
                .push((job.request_id.clone(), Instant::now()));

            let step = self
                .steps
                .lock()
                .get_mut(&job.request_id)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Step::Deliver);

            match step {
                Step::Deliver => Ok(AttemptReport {
                    disposition: Disposition::Delivered(DeliveryReceipt::now("primary")),
                    attempts: 1,
                }),
                Step::Reject(error) => Ok(AttemptReport {
                    disposition: Disposition::Rejected(error),
                    attempts: 1,
                }),
                Step::Error(message) => Err(RunnerError::Internal(message)),
                Step::Hang(pause) => {
                    tokio::time::sleep(pause).await;
                    Ok(AttemptReport {
                        disposition: Disposition::Delivered(DeliveryReceipt::now("primary")),
                        attempts: 1,
                    })
                }
            }
        }

        async fn on_job_failed(&self, job: &Job, error: &ErrorInfo) {
            self.failed
                .lock()
                .push((job.request_id.clone(), error.clone()));
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn queue_with(config: QueueConfig) -> (Arc<JobQueue>, broadcast::Sender<Signal>) {
        let (shutdown, _) = broadcast::channel(8);
        (Arc::new(JobQueue::new(config, shutdown.clone())), shutdown)
    }

    #[tokio::test]
    async fn test_priority_order_over_fifo() {
        let (queue, shutdown) = queue_with(fast_config());
        let runner = Arc::new(StubRunner::default());

        // Enqueue before starting the single worker so all are ready at
        // once: priority wins, FIFO within the same priority.
        queue.enqueue(job("low", 0, 0));
        queue.enqueue(job("high", 10, 0));
        queue.enqueue(job("mid-a", 5, 0));
        queue.enqueue(job("mid-b", 5, 0));

        let handles = queue.start(runner.clone() as Arc<dyn JobRunner>);
        wait_until(|| queue.stats().completed == 4).await;

        assert_eq!(runner.run_order(), vec!["high", "mid-a", "mid-b", "low"]);

        shutdown.send(Signal::Shutdown).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_delay_is_honoured() {
        let (queue, shutdown) = queue_with(fast_config());
        let runner = Arc::new(StubRunner::default());
        let handles = queue.start(runner.clone() as Arc<dyn JobRunner>);

        let delayed = job("delayed", 0, 150);
        let not_before = delayed.execute_not_before;
        queue.enqueue(delayed);

        wait_until(|| queue.stats().completed == 1).await;
        let ran_at = runner.run_instants("delayed")[0];
        assert!(ran_at >= not_before, "job ran before its delay elapsed");

        shutdown.send(Signal::Shutdown).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_safety_net_retry_then_success() {
        let (queue, shutdown) = queue_with(fast_config());
        let runner = Arc::new(StubRunner::default());
        runner.script("r1", vec![Step::Error("boom".to_string()), Step::Deliver]);

        let handles = queue.start(runner.clone() as Arc<dyn JobRunner>);
        queue.enqueue(job("r1", 0, 0));

        wait_until(|| queue.stats().completed == 1).await;
        let stats = queue.stats();
        assert_eq!(stats.queue_retries, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(runner.run_order().len(), 2);

        shutdown.send(Signal::Shutdown).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_safety_net_exhaustion_fails_job() {
        let (queue, shutdown) = queue_with(fast_config());
        let runner = Arc::new(StubRunner::default());
        runner.script(
            "r1",
            vec![
                Step::Error("first".to_string()),
                Step::Error("second".to_string()),
            ],
        );

        let handles = queue.start(runner.clone() as Arc<dyn JobRunner>);
        queue.enqueue(job("r1", 0, 0));

        wait_until(|| queue.stats().failed == 1).await;
        let failures = runner.failed.lock().clone();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].1.code, "ATTEMPT_ERROR");

        let archived = queue.latest_job_for_request("r1").unwrap();
        assert_eq!(archived.status, JobStatus::Failed);
        assert_eq!(archived.queue_retries, 1);

        shutdown.send(Signal::Shutdown).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_zero_max_retries_is_safe() {
        let mut config = fast_config();
        config.max_retries = 0;
        let (queue, shutdown) = queue_with(config);
        let runner = Arc::new(StubRunner::default());
        runner.script("r1", vec![Step::Error("boom".to_string())]);

        let handles = queue.start(runner.clone() as Arc<dyn JobRunner>);
        queue.enqueue(job("r1", 0, 0));

        wait_until(|| queue.stats().failed == 1).await;
        assert_eq!(queue.stats().queue_retries, 0);

        shutdown.send(Signal::Shutdown).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_watchdog_timeout_fails_without_requeue() {
        let mut config = fast_config();
        config.job_timeout_ms = 50;
        config.max_retries = 5;
        let (queue, shutdown) = queue_with(config);
        let runner = Arc::new(StubRunner::default());
        runner.script("slow", vec![Step::Hang(Duration::from_millis(500))]);

        let handles = queue.start(runner.clone() as Arc<dyn JobRunner>);
        queue.enqueue(job("slow", 0, 0));

        wait_until(|| queue.stats().failed == 1).await;

        // The watchdog is terminal: one run, no safety-net requeue.
        assert_eq!(runner.run_order().len(), 1);
        assert_eq!(queue.stats().queue_retries, 0);
        let failures = runner.failed.lock().clone();
        assert_eq!(failures[0].1.code, crate::error::PROCESSING_TIMEOUT);

        let archived = queue.latest_job_for_request("slow").unwrap();
        assert_eq!(archived.status, JobStatus::Failed);

        shutdown.send(Signal::Shutdown).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_history_ring_is_bounded() {
        let mut config = fast_config();
        config.history_limit = 2;
        let (queue, shutdown) = queue_with(config);
        let runner = Arc::new(StubRunner::default());
        let handles = queue.start(runner.clone() as Arc<dyn JobRunner>);

        for i in 0..5 {
            queue.enqueue(job(&format!("r{i}"), 0, 0));
        }

        wait_until(|| {
            let stats = queue.stats();
            stats.completed == 2 && stats.queued == 0 && stats.processing == 0
        })
        .await;

        // Only the most recent two survive; older lookups miss.
        assert!(queue.latest_job_for_request("r0").is_none());
        assert!(queue.latest_job_for_request("r4").is_some());

        shutdown.send(Signal::Shutdown).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_stuck_sweep_fails_orphaned_jobs() {
        let mut config = fast_config();
        config.job_timeout_ms = 10;
        let (queue, _shutdown) = queue_with(config);
        let runner = StubRunner::default();

        // Simulate a vanished worker: mark the job processing by hand.
        let stuck = job("stuck", 0, 0);
        let stuck_id = stuck.job_id;
        queue.enqueue(stuck);
        {
            let mut state = queue.state.lock();
            let job = state.jobs.get_mut(&stuck_id).unwrap();
            job.status = JobStatus::Processing;
            job.started_at = Instant::now().checked_sub(Duration::from_millis(100));
        }

        let failed = queue
            .sweep_stuck(Instant::now(), &runner)
            .await;
        assert_eq!(failed, 1);
        assert_eq!(queue.stats().failed, 1);
        let failures = runner.failed.lock().clone();
        assert_eq!(failures[0].1.code, crate::error::PROCESSING_TIMEOUT);
    }

    #[tokio::test]
    async fn test_shutdown_stops_workers_and_keeps_pending_jobs() {
        let (queue, shutdown) = queue_with(fast_config());
        let runner = Arc::new(StubRunner::default());
        let handles = queue.start(runner as Arc<dyn JobRunner>);

        // A far-future job never becomes eligible.
        queue.enqueue(job("later", 0, 60_000));

        shutdown.send(Signal::Shutdown).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }

        let stats = queue.stats();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.processing, 0);
    }

    #[tokio::test]
    async fn test_concurrency_respects_limit() {
        let mut config = fast_config();
        config.max_concurrency = 2;
        let (queue, shutdown) = queue_with(config);

        struct CountingRunner {
            current: AtomicUsize,
            peak: AtomicUsize,
        }

        #[async_trait]
        impl JobRunner for CountingRunner {
            async fn run(&self, _job: &Job) -> Result<AttemptReport, RunnerError> {
                let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                self.current.fetch_sub(1, Ordering::SeqCst);
                Ok(AttemptReport {
                    disposition: Disposition::Delivered(DeliveryReceipt::now("primary")),
                    attempts: 1,
                })
            }
        }

        let runner = Arc::new(CountingRunner {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let handles = queue.start(runner.clone() as Arc<dyn JobRunner>);

        for i in 0..6 {
            queue.enqueue(job(&format!("r{i}"), 0, 0));
        }

        wait_until(|| queue.stats().completed == 6).await;
        let peak = runner.peak.load(Ordering::SeqCst);
        assert!(peak <= 2, "worker pool exceeded its bound: {peak}");

        shutdown.send(Signal::Shutdown).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
