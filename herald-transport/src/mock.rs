//! Mock transports for development and testing.
//!
//! Two fakes cover the two ways the engine is exercised:
//! - [`MockTransport`] simulates a provider stochastically: configurable
//!   latency and a weighted mix of outcome classes. The demo binary wires
//!   two of these as its providers.
//! - [`ScriptedTransport`] replays a pre-programmed outcome sequence, for
//!   tests that need an exact failure/success pattern.
//!
//! Both record every attempted payload so tests can verify what the engine
//! actually sent, and how often.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use herald_common::MailPayload;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    error::{FailureKind, TransportFailure},
    transport::Transport,
    types::DeliveryReceipt,
};

/// Outcome weights and latency for a [`MockTransport`].
///
/// Outcome classes are drawn from one uniform roll: success first, then
/// rate-limited, then permanent-local; the remainder is transient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockBehavior {
    /// Probability of a successful send.
    #[serde(default = "default_success_rate")]
    pub success_rate: f64,

    /// Probability of a rate-limited rejection.
    #[serde(default = "default_rate_limited_rate")]
    pub rate_limited_rate: f64,

    /// Probability of a permanent-local rejection.
    #[serde(default)]
    pub permanent_local_rate: f64,

    /// Lower bound of the simulated latency.
    #[serde(default = "default_min_latency_ms")]
    pub min_latency_ms: u64,

    /// Upper bound of the simulated latency.
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: u64,

    /// `retry_after` attached to rate-limited rejections.
    #[serde(default = "default_retry_after_ms")]
    pub retry_after_ms: u64,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            success_rate: default_success_rate(),
            rate_limited_rate: default_rate_limited_rate(),
            permanent_local_rate: 0.0,
            min_latency_ms: default_min_latency_ms(),
            max_latency_ms: default_max_latency_ms(),
            retry_after_ms: default_retry_after_ms(),
        }
    }
}

const fn default_success_rate() -> f64 {
    0.9
}

const fn default_rate_limited_rate() -> f64 {
    0.05
}

const fn default_min_latency_ms() -> u64 {
    5
}

const fn default_max_latency_ms() -> u64 {
    25
}

const fn default_retry_after_ms() -> u64 {
    1_000
}

impl MockBehavior {
    /// A transport that always succeeds, with no simulated latency.
    #[must_use]
    pub const fn reliable() -> Self {
        Self {
            success_rate: 1.0,
            rate_limited_rate: 0.0,
            permanent_local_rate: 0.0,
            min_latency_ms: 0,
            max_latency_ms: 0,
            retry_after_ms: default_retry_after_ms(),
        }
    }

    /// A transport that always fails transiently, with no latency.
    #[must_use]
    pub const fn failing() -> Self {
        Self {
            success_rate: 0.0,
            rate_limited_rate: 0.0,
            permanent_local_rate: 0.0,
            min_latency_ms: 0,
            max_latency_ms: 0,
            retry_after_ms: default_retry_after_ms(),
        }
    }
}

/// Stochastic provider simulator.
#[derive(Debug)]
pub struct MockTransport {
    name: String,
    behavior: MockBehavior,
    attempts: AtomicU64,
    sent: Mutex<Vec<MailPayload>>,
}

impl MockTransport {
    pub fn new(name: impl Into<String>, behavior: MockBehavior) -> Self {
        Self {
            name: name.into(),
            behavior,
            attempts: AtomicU64::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Number of send attempts observed, successful or not.
    pub fn attempt_count(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Payloads of every attempt, in arrival order.
    pub fn sent(&self) -> Vec<MailPayload> {
        self.sent.lock().clone()
    }

    fn roll(&self) -> Result<(), TransportFailure> {
        let draw: f64 = rand::rng().random();

        if draw < self.behavior.success_rate {
            return Ok(());
        }
        if draw < self.behavior.success_rate + self.behavior.rate_limited_rate {
            return Err(TransportFailure::new(
                FailureKind::RateLimited,
                "RATE_LIMITED",
                "simulated provider quota exhausted",
            )
            .with_retry_after(Duration::from_millis(self.behavior.retry_after_ms)));
        }
        if draw
            < self.behavior.success_rate
                + self.behavior.rate_limited_rate
                + self.behavior.permanent_local_rate
        {
            return Err(TransportFailure::new(
                FailureKind::PermanentLocal,
                "CONTENT_REJECTED",
                "simulated provider content policy rejection",
            ));
        }

        Err(TransportFailure::new(
            FailureKind::Transient,
            "SERVICE_UNAVAILABLE",
            "simulated provider outage",
        ))
    }

    fn latency(&self) -> Duration {
        if self.behavior.max_latency_ms == 0 {
            return Duration::ZERO;
        }
        let ms = rand::rng().random_range(self.behavior.min_latency_ms..=self.behavior.max_latency_ms);
        Duration::from_millis(ms)
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, payload: &MailPayload) -> Result<DeliveryReceipt, TransportFailure> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().push(payload.clone());

        let latency = self.latency();
        let outcome = self.roll();

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        outcome.map(|()| DeliveryReceipt::now(&self.name))
    }
}

/// One pre-programmed outcome for a [`ScriptedTransport`].
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    /// Accept the message.
    Deliver,
    /// Reject the message with the given failure.
    Fail(TransportFailure),
}

/// Replays a fixed outcome sequence, then succeeds once the script runs dry.
#[derive(Debug)]
pub struct ScriptedTransport {
    name: String,
    script: Mutex<VecDeque<ScriptedOutcome>>,
    attempts: AtomicU64,
    sent: Mutex<Vec<MailPayload>>,
}

impl ScriptedTransport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            attempts: AtomicU64::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Append one outcome to the script.
    pub fn push(&self, outcome: ScriptedOutcome) {
        self.script.lock().push_back(outcome);
    }

    /// Append `count` copies of the same failure.
    pub fn push_failures(&self, count: usize, failure: &TransportFailure) {
        let mut script = self.script.lock();
        for _ in 0..count {
            script.push_back(ScriptedOutcome::Fail(failure.clone()));
        }
    }

    /// Number of send attempts observed.
    pub fn attempt_count(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Payloads of every attempt, in arrival order.
    pub fn sent(&self) -> Vec<MailPayload> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, payload: &MailPayload) -> Result<DeliveryReceipt, TransportFailure> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().push(payload.clone());

        let next = self.script.lock().pop_front();
        match next {
            Some(ScriptedOutcome::Fail(failure)) => Err(failure),
            Some(ScriptedOutcome::Deliver) | None => Ok(DeliveryReceipt::now(&self.name)),
        }
    }
}
