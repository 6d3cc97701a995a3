//! Resilient in-process message-delivery engine.
//!
//! A caller submits a [`herald_common::SendRequest`]; the engine
//! guarantees at-most-one logical delivery per request id, failover
//! across two transports, bounded retry with exponential backoff,
//! circuit-breaker protection of unhealthy transports, token-bucket
//! admission limiting, and an observable status for every request.
//!
//! Request lifecycle:
//! admission ([`RateLimiter`], [`IdempotencyStore`]) → [`JobQueue`] →
//! worker → [`DeliveryEngine::attempt`] via breaker-wrapped transports →
//! terminal record → [`DeliveryEngine::status`] projection.

#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

pub mod circuit_breaker;
pub mod engine;
pub mod error;
pub mod idempotency;
pub mod queue;
pub mod rate_limiter;
pub mod service;
pub mod types;

pub use circuit_breaker::{BreakerConfig, BreakerMode, BreakerStatus, CircuitBreakers};
pub use engine::{DeliveryEngine, EngineConfig};
pub use error::{CIRCUIT_OPEN, ErrorInfo, ErrorKind, PROCESSING_TIMEOUT, SubmitError};
pub use idempotency::{
    Admission, IdempotencyConfig, IdempotencyStore, LifecycleRecord, RecordStatus,
};
pub use queue::{
    AttemptReport, Disposition, JobQueue, JobRunner, QueueConfig, RunnerError,
};
pub use rate_limiter::{ANONYMOUS_KEY, Decision, RateLimitConfig, RateLimiter};
pub use service::StatusService;
pub use types::{Job, JobId, JobStatus, QueueStats, ReportState, StatusReport, SubmitOutcome};
