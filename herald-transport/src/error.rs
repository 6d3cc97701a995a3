//! Typed failure classification for transport sends.
//!
//! Every failed send is reported as a [`TransportFailure`] carrying a
//! [`FailureKind`]. The kind drives the engine's decisions:
//! - `Transient`: retry the same transport, fall back when exhausted
//! - `RateLimited`: like `Transient`, but honour `retry_after` first
//! - `PermanentLocal`: skip remaining retries here, the other transport
//!   may still accept the message
//! - `PermanentGlobal`: abort immediately, no retry, no fallback

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a failed send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// Retryable against the same transport.
    Transient,
    /// Retryable after the provider-indicated wait.
    RateLimited,
    /// This transport will never accept the message; another might.
    PermanentLocal,
    /// No transport will accept the message.
    PermanentGlobal,
}

impl FailureKind {
    /// Whether this failure counts toward opening a circuit breaker.
    ///
    /// Permanent rejections say nothing about transport health, so only
    /// `Transient` and `RateLimited` count.
    pub const fn counts_against_breaker(self) -> bool {
        matches!(self, Self::Transient | Self::RateLimited)
    }

    /// Whether the engine may retry the same transport after this failure.
    pub const fn allows_retry(self) -> bool {
        matches!(self, Self::Transient | Self::RateLimited)
    }

    /// Whether the engine may fall back to the other transport.
    pub const fn allows_fallback(self) -> bool {
        !matches!(self, Self::PermanentGlobal)
    }
}

/// A failed send attempt, as reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct TransportFailure {
    /// Failure classification, drives retry/fallback decisions.
    pub kind: FailureKind,

    /// Minimum wait before the next attempt on this transport, when the
    /// provider indicated one. Overrides the engine's backoff schedule.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub retry_after: Option<Duration>,

    /// Stable machine-readable code, e.g. `RATE_LIMITED`.
    pub code: String,

    /// Human-readable detail for observability; never a stack trace.
    pub message: String,
}

impl TransportFailure {
    /// Build a failure with no `retry_after` hint.
    pub fn new(kind: FailureKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            retry_after: None,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Attach a provider-indicated wait.
    #[must_use]
    pub const fn with_retry_after(mut self, wait: Duration) -> Self {
        self.retry_after = Some(wait);
        self
    }
}
