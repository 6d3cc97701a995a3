//! Per-transport circuit breaker to protect unhealthy providers.
//!
//! The breaker has three states:
//! - **Closed**: normal operation, attempts pass through
//! - **Open**: tripped, attempts are short-circuited with a synthetic
//!   transient failure until the open window elapses
//! - **Half-Open**: probing recovery; enough consecutive successes close
//!   the circuit, any failure reopens it
//!
//! Only `Transient` and `RateLimited` failures count toward opening:
//! permanent rejections describe the message, not the transport's health.
//!
//! ```text
//! ┌─────────┐  failure_threshold reached   ┌──────┐
//! │ Closed  │ ──────────────────────────>  │ Open │
//! └─────────┘                              └──────┘
//!     ^                                       │
//!     │ success_threshold                     │ open window elapsed
//!     │ successes                             v
//!     │                       ┌───────────────┐
//!     └───────────────────────│   Half-Open   │
//!                             └───────────────┘
//!                                     │ any failure
//!                                     v
//!                                  ┌──────┐
//!                                  │ Open │
//!                                  └──────┘
//! ```

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use herald_common::{MailPayload, tracing};
use herald_transport::{DeliveryReceipt, FailureKind, Transport, TransportFailure};
use serde::{Deserialize, Serialize};

use crate::error::CIRCUIT_OPEN;

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive countable failures required to open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive successes needed to close the circuit from half-open.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// How long the circuit stays open before probing recovery.
    #[serde(default = "default_open_duration_ms")]
    pub open_duration_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_duration_ms: default_open_duration_ms(),
        }
    }
}

const fn default_failure_threshold() -> u32 {
    5
}

const fn default_success_threshold() -> u32 {
    2
}

const fn default_open_duration_ms() -> u64 {
    30_000
}

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerMode {
    Closed,
    Open,
    HalfOpen,
}

/// Per-transport breaker state.
#[derive(Debug)]
struct BreakerData {
    mode: BreakerMode,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_until: Option<Instant>,
    config: BreakerConfig,
}

impl BreakerData {
    const fn new(config: BreakerConfig) -> Self {
        Self {
            mode: BreakerMode::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_until: None,
            config,
        }
    }

    fn open(&mut self, now: Instant) {
        self.mode = BreakerMode::Open;
        self.opened_until = Some(now + Duration::from_millis(self.config.open_duration_ms));
        self.consecutive_successes = 0;
    }

    /// Decide whether an attempt may proceed.
    ///
    /// Returns `None` to proceed, or the remaining open window to
    /// short-circuit with. The first acquire at or past `opened_until`
    /// transitions to half-open and proceeds.
    fn try_acquire(&mut self, now: Instant, transport: &str) -> Option<Duration> {
        match self.mode {
            BreakerMode::Closed | BreakerMode::HalfOpen => None,
            BreakerMode::Open => {
                let until = self.opened_until?;
                if now >= until {
                    self.mode = BreakerMode::HalfOpen;
                    self.consecutive_successes = 0;
                    tracing::info!(
                        transport = %transport,
                        "circuit breaker entering half-open, probing recovery"
                    );
                    None
                } else {
                    Some(until - now)
                }
            }
        }
    }

    fn record_success(&mut self, transport: &str) {
        match self.mode {
            BreakerMode::Closed => {
                self.consecutive_failures = 0;
            }
            BreakerMode::HalfOpen => {
                self.consecutive_successes += 1;
                if self.consecutive_successes >= self.config.success_threshold {
                    self.mode = BreakerMode::Closed;
                    self.consecutive_failures = 0;
                    self.consecutive_successes = 0;
                    self.opened_until = None;
                    tracing::info!(
                        transport = %transport,
                        "circuit breaker closed, normal operation resumed"
                    );
                }
            }
            BreakerMode::Open => {}
        }
    }

    fn record_failure(&mut self, now: Instant, transport: &str, counts: bool) {
        match self.mode {
            BreakerMode::Closed => {
                if !counts {
                    return;
                }
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.open(now);
                    tracing::warn!(
                        transport = %transport,
                        failures = self.consecutive_failures,
                        open_ms = self.config.open_duration_ms,
                        "circuit breaker opened"
                    );
                }
            }
            BreakerMode::HalfOpen => {
                // The probe failed; reopen with a fresh window.
                self.open(now);
                tracing::warn!(
                    transport = %transport,
                    "circuit breaker probe failed, reopening"
                );
            }
            BreakerMode::Open => {}
        }
    }
}

/// Snapshot of one breaker's state for admin queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerStatus {
    pub mode: BreakerMode,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Remaining open window, when the circuit is open.
    pub open_remaining_ms: Option<u64>,
}

/// Registry of per-transport circuit breakers.
#[derive(Debug)]
pub struct CircuitBreakers {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<parking_lot::Mutex<BreakerData>>>,
}

impl CircuitBreakers {
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    fn breaker(&self, transport: &str) -> Arc<parking_lot::Mutex<BreakerData>> {
        self.breakers
            .entry(transport.to_string())
            .or_insert_with(|| {
                Arc::new(parking_lot::Mutex::new(BreakerData::new(
                    self.config.clone(),
                )))
            })
            .clone()
    }

    /// Run one attempt through the breaker for `transport`.
    ///
    /// While the circuit is open this fails fast with a synthetic
    /// `Transient` failure whose `retry_after` is the remaining open
    /// window; the transport is not called.
    ///
    /// # Errors
    ///
    /// Returns the transport's own failure, or the synthetic short-circuit.
    pub async fn run(
        &self,
        transport: &Arc<dyn Transport>,
        payload: &MailPayload,
    ) -> Result<DeliveryReceipt, TransportFailure> {
        let name = transport.name().to_string();
        let breaker = self.breaker(&name);

        if let Some(remaining) = breaker.lock().try_acquire(Instant::now(), &name) {
            tracing::debug!(
                transport = %name,
                remaining_ms = remaining.as_millis() as u64,
                "circuit open, short-circuiting attempt"
            );
            return Err(TransportFailure::new(
                FailureKind::Transient,
                CIRCUIT_OPEN,
                format!("circuit open for transport {name}"),
            )
            .with_retry_after(remaining));
        }

        match transport.send(payload).await {
            Ok(receipt) => {
                breaker.lock().record_success(&name);
                Ok(receipt)
            }
            Err(failure) => {
                breaker.lock().record_failure(
                    Instant::now(),
                    &name,
                    failure.kind.counts_against_breaker(),
                );
                Err(failure)
            }
        }
    }

    /// Snapshot the breaker state for a transport.
    pub fn status(&self, transport: &str) -> BreakerStatus {
        let breaker = self.breaker(transport);
        let data = breaker.lock();
        let now = Instant::now();
        BreakerStatus {
            mode: data.mode,
            consecutive_failures: data.consecutive_failures,
            consecutive_successes: data.consecutive_successes,
            open_remaining_ms: data.opened_until.and_then(|until| {
                (data.mode == BreakerMode::Open && until > now)
                    .then(|| (until - now).as_millis() as u64)
            }),
        }
    }

    /// Force a breaker closed, clearing all counters.
    pub fn reset(&self, transport: &str) {
        let breaker = self.breaker(transport);
        *breaker.lock() = BreakerData::new(self.config.clone());
        tracing::info!(transport = %transport, "circuit breaker reset");
    }

    /// Reset every known breaker.
    pub fn reset_all(&self) {
        for entry in &self.breakers {
            *entry.value().lock() = BreakerData::new(self.config.clone());
        }
    }

    /// Force a breaker open for a full open window.
    pub fn force_open(&self, transport: &str) {
        let breaker = self.breaker(transport);
        breaker.lock().open(Instant::now());
        tracing::warn!(transport = %transport, "circuit breaker forced open");
    }
}
