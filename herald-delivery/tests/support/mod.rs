//! Shared fixtures for the engine integration tests.
#![allow(dead_code)] // Test utility module - not all helpers used in every test

use std::{
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use herald_common::{MailPayload, SendRequest};
use herald_delivery::{DeliveryEngine, EngineConfig, QueueConfig, ReportState};
use herald_transport::{
    DeliveryReceipt, FailureKind, ScriptedTransport, Transport, TransportFailure,
};

/// Engine config with millisecond-scale delays so scenarios finish fast.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        max_attempts_per_transport: 3,
        initial_retry_delay_ms: 20,
        max_retry_delay_ms: 200,
        retry_multiplier: 2,
        queue: QueueConfig {
            max_concurrency: 2,
            poll_interval_ms: 20,
            job_timeout_ms: 5_000,
            retry_base_delay_ms: 10,
            ..QueueConfig::default()
        },
        ..EngineConfig::default()
    }
}

/// Build and start an engine over two scripted transports.
pub fn engine_with(
    config: EngineConfig,
    primary: &Arc<ScriptedTransport>,
    secondary: &Arc<ScriptedTransport>,
) -> Arc<DeliveryEngine> {
    DeliveryEngine::start(
        config,
        Arc::clone(primary) as Arc<dyn Transport>,
        Arc::clone(secondary) as Arc<dyn Transport>,
    )
}

pub fn scripted_pair() -> (Arc<ScriptedTransport>, Arc<ScriptedTransport>) {
    (
        Arc::new(ScriptedTransport::new("primary")),
        Arc::new(ScriptedTransport::new("secondary")),
    )
}

pub fn request(request_id: &str) -> SendRequest {
    SendRequest {
        to: "a@b.co".to_string(),
        subject: "s".to_string(),
        body: "x".to_string(),
        request_id: request_id.to_string(),
        priority: 0,
        delay_ms: 0,
    }
}

pub fn transient() -> TransportFailure {
    TransportFailure::new(FailureKind::Transient, "SERVICE_UNAVAILABLE", "outage")
}

pub fn transient_with_retry_after(ms: u64) -> TransportFailure {
    transient().with_retry_after(Duration::from_millis(ms))
}

pub fn permanent_local(code: &str) -> TransportFailure {
    TransportFailure::new(FailureKind::PermanentLocal, code, "rejected by provider")
}

pub fn permanent_global(code: &str) -> TransportFailure {
    TransportFailure::new(FailureKind::PermanentGlobal, code, "rejected for good")
}

/// Poll the projection until the request reaches `state`.
///
/// # Panics
///
/// Panics when the state is not reached within five seconds.
pub async fn wait_for_state(engine: &DeliveryEngine, request_id: &str, state: ReportState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(report) = engine.status(request_id) {
            if report.state == state {
                return;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "request {request_id} did not reach {state:?} in time, currently {:?}",
            engine.status(request_id).map(|r| r.state)
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A transport whose sends never finish inside any sane watchdog window.
pub struct HangingTransport {
    name: String,
}

impl HangingTransport {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Transport for HangingTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, _payload: &MailPayload) -> Result<DeliveryReceipt, TransportFailure> {
        tokio::time::sleep(Duration::from_secs(600)).await;
        Ok(DeliveryReceipt::now(&self.name))
    }
}
