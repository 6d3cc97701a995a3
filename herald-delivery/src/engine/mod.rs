//! The delivery engine: admission, orchestration, projection, admin.
//!
//! One [`DeliveryEngine`] value owns every collaborator (breaker
//! registry, rate limiter, idempotency store, job queue) and is the
//! single initialization root. Submission flows validate → rate-limit →
//! dedupe → enqueue; workers call back into [`DeliveryEngine::attempt`]
//! (see the `attempt` module) through the queue's runner contract.

mod attempt;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant, SystemTime},
};

use async_trait::async_trait;
use herald_common::{SendRequest, Signal, tracing};
use herald_transport::Transport;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{
    circuit_breaker::{BreakerConfig, BreakerStatus, CircuitBreakers},
    error::{ErrorInfo, SubmitError},
    idempotency::{Admission, IdempotencyConfig, IdempotencyStore, RecordStatus},
    queue::{AttemptReport, Disposition, JobQueue, JobRunner, QueueConfig, RunnerError},
    rate_limiter::{ANONYMOUS_KEY, Decision, RateLimitConfig, RateLimiter},
    types::{Job, JobStatus, QueueStats, ReportState, StatusReport, SubmitOutcome},
};

/// Engine configuration. Every field has a serde default so a partial
/// TOML document deserializes into a runnable config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Inner retry cap per transport.
    #[serde(default = "default_max_attempts_per_transport")]
    pub max_attempts_per_transport: u32,

    /// First backoff delay of the per-transport retry loop.
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,

    /// Upper bound of the backoff schedule.
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,

    /// Backoff growth factor.
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: u32,

    /// Wrap transports in circuit breakers.
    #[serde(default = "default_true")]
    pub enable_breaker: bool,

    /// Deliver through the job queue; disabled means synchronous attempts
    /// inside `submit`.
    #[serde(default = "default_true")]
    pub enable_queue: bool,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub rate: RateLimitConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub idempotency: IdempotencyConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_transport: default_max_attempts_per_transport(),
            initial_retry_delay_ms: default_initial_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            retry_multiplier: default_retry_multiplier(),
            enable_breaker: true,
            enable_queue: true,
            breaker: BreakerConfig::default(),
            rate: RateLimitConfig::default(),
            queue: QueueConfig::default(),
            idempotency: IdempotencyConfig::default(),
        }
    }
}

const fn default_max_attempts_per_transport() -> u32 {
    3
}

const fn default_initial_retry_delay_ms() -> u64 {
    1_000
}

const fn default_max_retry_delay_ms() -> u64 {
    30_000
}

const fn default_retry_multiplier() -> u32 {
    2
}

const fn default_true() -> bool {
    true
}

/// The delivery engine. Owns its collaborators; see the crate docs for
/// the request lifecycle.
pub struct DeliveryEngine {
    pub(crate) config: EngineConfig,
    pub(crate) transports: Vec<Arc<dyn Transport>>,
    pub(crate) breakers: CircuitBreakers,
    pub(crate) limiter: RateLimiter,
    pub(crate) store: IdempotencyStore,
    pub(crate) queue: Arc<JobQueue>,
    pub(crate) shutdown: broadcast::Sender<Signal>,
    accepting: AtomicBool,
    tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// Adapter giving the queue's workers access to the engine's attempt
/// loop and terminal-record bookkeeping.
struct EngineRunner {
    engine: Arc<DeliveryEngine>,
}

#[async_trait]
impl JobRunner for EngineRunner {
    async fn run(&self, job: &Job) -> Result<AttemptReport, RunnerError> {
        self.engine.attempt(job).await
    }

    async fn on_job_failed(&self, job: &Job, error: &ErrorInfo) {
        self.engine.store.fail(&job.request_id, error.clone());
    }
}

impl DeliveryEngine {
    /// Build the engine and start its background tasks.
    ///
    /// `primary` is tried before `secondary` on every attempt sequence.
    pub fn start(
        config: EngineConfig,
        primary: Arc<dyn Transport>,
        secondary: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let (shutdown, _) = broadcast::channel(16);
        let queue = Arc::new(JobQueue::new(config.queue.clone(), shutdown.clone()));

        let engine = Arc::new(Self {
            breakers: CircuitBreakers::new(config.breaker.clone()),
            limiter: RateLimiter::new(config.rate.clone()),
            store: IdempotencyStore::new(&config.idempotency),
            transports: vec![primary, secondary],
            queue,
            shutdown: shutdown.clone(),
            accepting: AtomicBool::new(true),
            tasks: parking_lot::Mutex::new(Vec::new()),
            config,
        });

        let mut handles = if engine.config.enable_queue {
            let runner: Arc<dyn JobRunner> = Arc::new(EngineRunner {
                engine: Arc::clone(&engine),
            });
            engine.queue.start(runner)
        } else {
            Vec::new()
        };

        {
            let sweeper = Arc::clone(&engine);
            let mut shutdown_rx = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                let interval =
                    Duration::from_millis(sweeper.config.idempotency.sweep_interval_ms);
                loop {
                    tokio::select! {
                        () = tokio::time::sleep(interval) => {
                            sweeper.store.sweep_expired(SystemTime::now());
                            sweeper.limiter.sweep_idle(Instant::now());
                        }
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }));
        }

        *engine.tasks.lock() = handles;
        tracing::info!(
            breaker = engine.config.enable_breaker,
            queue = engine.config.enable_queue,
            concurrency = engine.config.queue.max_concurrency,
            "delivery engine started"
        );
        engine
    }

    /// Submit a request under the anonymous rate-limit key.
    ///
    /// # Errors
    ///
    /// See [`SubmitError`].
    pub async fn submit(&self, request: SendRequest) -> Result<SubmitOutcome, SubmitError> {
        self.submit_as(ANONYMOUS_KEY, request).await
    }

    /// Submit a request on behalf of a named submitter.
    ///
    /// Admission order: shutdown gate, validation, rate limit, dedupe.
    /// A duplicate is not an error: it reports the known state of the
    /// original submission.
    ///
    /// # Errors
    ///
    /// See [`SubmitError`].
    pub async fn submit_as(
        &self,
        submitter: &str,
        request: SendRequest,
    ) -> Result<SubmitOutcome, SubmitError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(SubmitError::ShuttingDown);
        }

        request.validate()?;

        if let Decision::Limited { retry_after } = self.limiter.check(submitter) {
            return Err(SubmitError::RateLimited { retry_after });
        }

        match self.store.begin_or_get(&request.request_id) {
            Admission::Existing(record) => {
                tracing::debug!(
                    request_id = %request.request_id,
                    status = ?record.status,
                    "duplicate submission"
                );
                match record.status {
                    RecordStatus::Completed => {
                        if let Some(receipt) = record.result {
                            return Ok(SubmitOutcome::CompletedCached { receipt });
                        }
                    }
                    RecordStatus::Failed => {
                        if let Some(error) = record.error {
                            return Ok(SubmitOutcome::FailedCached { error });
                        }
                    }
                    RecordStatus::Pending => {}
                }
                Ok(SubmitOutcome::Pending {
                    request_id: request.request_id,
                })
            }
            Admission::Fresh(_) => {
                if self.config.enable_queue {
                    let job = Job::new(
                        request.request_id.clone(),
                        request.payload(),
                        request.priority,
                        request.delay_ms,
                    );
                    let job_id = self.queue.enqueue(job);
                    tracing::info!(
                        request_id = %request.request_id,
                        job_id = %job_id,
                        priority = request.priority,
                        delay_ms = request.delay_ms,
                        "request queued"
                    );
                    return Ok(SubmitOutcome::Queued {
                        job_id,
                        request_id: request.request_id,
                    });
                }

                // Queue disabled: run the attempt sequence inline.
                let job = Job::new(
                    request.request_id.clone(),
                    request.payload(),
                    request.priority,
                    0,
                );
                match self.attempt(&job).await {
                    Ok(report) => match report.disposition {
                        Disposition::Delivered(receipt) => Ok(SubmitOutcome::Sent { receipt }),
                        Disposition::Rejected(error) => Err(SubmitError::Failed(error)),
                    },
                    Err(_interrupted) => Err(SubmitError::ShuttingDown),
                }
            }
        }
    }

    /// Project the externally-visible status of a request.
    ///
    /// The latest job wins when one exists; the lifecycle record alone
    /// covers synchronous-mode requests. `None` means the request id is
    /// unknown (or its record expired).
    pub fn status(&self, request_id: &str) -> Option<StatusReport> {
        let record = self.store.get(request_id)?;
        let job = self.queue.latest_job_for_request(request_id);

        let state = job.as_ref().map_or_else(
            || match record.status {
                RecordStatus::Pending => ReportState::Pending,
                RecordStatus::Completed => ReportState::Sent,
                RecordStatus::Failed => ReportState::Failed,
            },
            |job| match job.status {
                JobStatus::Queued => ReportState::Queued,
                JobStatus::Processing => ReportState::Processing,
                JobStatus::Retrying => ReportState::Retrying,
                JobStatus::Completed => ReportState::Sent,
                JobStatus::Failed => ReportState::Failed,
            },
        );

        let message_id = record
            .result
            .as_ref()
            .map(|receipt| receipt.message_id.clone())
            .or_else(|| {
                job.as_ref()
                    .and_then(|job| job.result.as_ref().map(|r| r.message_id.clone()))
            });

        let error = record
            .error
            .clone()
            .or_else(|| job.as_ref().and_then(|job| job.last_error.clone()));

        Some(StatusReport {
            request_id: record.request_id,
            state,
            attempts: record.attempts,
            current_transport: record.current_transport,
            message_id,
            error,
            created_at: record.created_at,
            last_attempt_at: record.last_attempt_at,
            updated_at: record.updated_at,
        })
    }

    /// Reset one breaker, or every breaker when no name is given.
    pub fn reset_breaker(&self, transport: Option<&str>) {
        match transport {
            Some(name) => self.breakers.reset(name),
            None => self.breakers.reset_all(),
        }
    }

    /// Force a breaker open for a full open window.
    pub fn force_open_breaker(&self, transport: &str) {
        self.breakers.force_open(transport);
    }

    /// Snapshot one breaker's state.
    pub fn breaker_status(&self, transport: &str) -> BreakerStatus {
        self.breakers.status(transport)
    }

    /// Drop every idempotency record. Test/admin hook.
    pub fn clear_idempotency(&self) {
        self.store.clear();
    }

    /// Queue counters.
    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Run the expiry and idle-bucket sweeps once, synchronously.
    /// Returns the number of idempotency records removed.
    pub fn sweep_now(&self) -> usize {
        let removed = self.store.sweep_expired(SystemTime::now());
        self.limiter.sweep_idle(Instant::now());
        removed
    }

    /// Stop admitting work, signal every task, and wait out the grace
    /// period. Jobs still `Queued`/`Retrying` afterwards are dropped with
    /// the process; durability across restarts is out of scope.
    pub async fn shutdown(&self, grace: Duration) {
        self.accepting.store(false, Ordering::Release);
        let _ = self.shutdown.send(Signal::Shutdown);

        let handles = std::mem::take(&mut *self.tasks.lock());
        let deadline = Instant::now() + grace;
        for mut handle in handles {
            let left = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(left, &mut handle).await.is_err() {
                handle.abort();
            }
        }
        tracing::info!("delivery engine stopped");
    }
}

impl std::fmt::Debug for DeliveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryEngine")
            .field("config", &self.config)
            .field(
                "transports",
                &self
                    .transports
                    .iter()
                    .map(|t| t.name().to_string())
                    .collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_attempts_per_transport, 3);
        assert_eq!(config.initial_retry_delay_ms, 1_000);
        assert_eq!(config.max_retry_delay_ms, 30_000);
        assert_eq!(config.retry_multiplier, 2);
        assert!(config.enable_breaker);
        assert!(config.enable_queue);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.success_threshold, 2);
        assert_eq!(config.breaker.open_duration_ms, 30_000);
        assert_eq!(config.rate.capacity, 100);
        assert_eq!(config.rate.window_ms, 60_000);
        assert_eq!(config.queue.max_concurrency, 5);
        assert_eq!(config.queue.job_timeout_ms, 90_000);
        assert_eq!(config.idempotency.ttl_ms, 86_400_000);
    }
}
