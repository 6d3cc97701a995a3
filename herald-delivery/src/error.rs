//! Engine-visible error taxonomy.
//!
//! Transport failures never propagate past the engine: they are converted
//! into [`ErrorInfo`] values and written to the idempotency store. The
//! submit surface returns structured [`SubmitError`]s that an HTTP layer
//! can map directly onto response codes.

use std::time::Duration;

use herald_common::ValidationErrors;
use herald_transport::{FailureKind, TransportFailure};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Code recorded when the worker watchdog fires.
pub const PROCESSING_TIMEOUT: &str = "PROCESSING_TIMEOUT";
/// Code carried by a circuit-breaker short-circuit.
pub const CIRCUIT_OPEN: &str = "CIRCUIT_OPEN";

/// Terminal-failure classification, as exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Retryable failure that still ended the attempt sequence.
    Transient,
    /// Provider asked for a slowdown.
    RateLimited,
    /// One transport rejected the message for its own reasons.
    ProviderSpecific,
    /// No transport will ever accept the message.
    Fatal,
    /// The worker watchdog cut the attempt short.
    Timeout,
    /// Every transport and retry was consumed.
    Exhausted,
}

impl From<FailureKind> for ErrorKind {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Transient => Self::Transient,
            FailureKind::RateLimited => Self::RateLimited,
            FailureKind::PermanentLocal => Self::ProviderSpecific,
            FailureKind::PermanentGlobal => Self::Fatal,
        }
    }
}

/// Terminal failure payload stored per request and exposed on status
/// queries. Never contains transport internals.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
        }
    }

    /// The watchdog outcome recorded for a timed-out job.
    pub fn watchdog_timeout() -> Self {
        Self::new(
            ErrorKind::Timeout,
            PROCESSING_TIMEOUT,
            "attempt exceeded the job timeout",
        )
    }

    /// Terminal record for an exhausted attempt sequence, keeping the last
    /// observed failure's code and message.
    pub fn exhausted(last: &TransportFailure) -> Self {
        Self::new(ErrorKind::Exhausted, &last.code, &last.message)
    }
}

impl From<&TransportFailure> for ErrorInfo {
    fn from(failure: &TransportFailure) -> Self {
        Self::new(failure.kind.into(), &failure.code, &failure.message)
    }
}

/// Why a submission was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// Request shape invalid; lists every offending field.
    #[error(transparent)]
    Validation(#[from] ValidationErrors),

    /// Token bucket for the submitter is exhausted.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// The engine is shutting down and no longer admits work.
    #[error("engine is shutting down")]
    ShuttingDown,

    /// Synchronous-mode delivery reached a terminal failure.
    #[error("delivery failed: {0}")]
    Failed(ErrorInfo),
}
