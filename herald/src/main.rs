//! Demo composition root: two stochastic mock providers behind the
//! delivery engine, driven by `herald.config.toml`.

use std::{sync::Arc, time::Duration};

use herald_common::{internal, logging, tracing};
use herald_delivery::{DeliveryEngine, EngineConfig, ReportState};
use herald_transport::{MockBehavior, MockTransport, Transport};
use serde::{Deserialize, Serialize};

const CONFIG_PATH: &str = "./herald.config.toml";

#[derive(Debug, Serialize, Deserialize)]
struct HeraldConfig {
    /// Demo messages submitted at boot.
    #[serde(default = "default_demo_messages")]
    demo_messages: u32,

    #[serde(default)]
    engine: EngineConfig,

    /// Behavior of the primary mock provider.
    #[serde(default)]
    primary: MockBehavior,

    /// Behavior of the secondary mock provider.
    #[serde(default)]
    secondary: MockBehavior,
}

impl Default for HeraldConfig {
    fn default() -> Self {
        Self {
            demo_messages: default_demo_messages(),
            engine: EngineConfig::default(),
            primary: MockBehavior::default(),
            secondary: MockBehavior::default(),
        }
    }
}

const fn default_demo_messages() -> u32 {
    5
}

fn load_config(path: &str) -> anyhow::Result<HeraldConfig> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(toml::from_str(&raw)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            internal!(level = INFO, "no config file at {path}, using defaults");
            Ok(HeraldConfig::default())
        }
        Err(err) => Err(err.into()),
    }
}

async fn seed_demo(engine: &DeliveryEngine, count: u32) {
    let boot = std::process::id();
    for i in 0..count {
        let request = herald_common::SendRequest {
            to: format!("recipient-{i}@example.com"),
            subject: format!("herald demo message {i}"),
            body: "Delivered by the herald demo engine.".to_string(),
            request_id: format!("demo-{boot}-{i}"),
            priority: u8::try_from(i % 11).unwrap_or(0),
            delay_ms: u64::from(i) * 200,
        };
        match engine.submit(request).await {
            Ok(outcome) => tracing::info!(outcome = ?outcome, "demo message submitted"),
            Err(err) => tracing::warn!(error = %err, "demo submission rejected"),
        }
    }

    // Report each demo message once it reaches a terminal state.
    for i in 0..count {
        let request_id = format!("demo-{boot}-{i}");
        loop {
            match engine.status(&request_id) {
                Some(report)
                    if matches!(report.state, ReportState::Sent | ReportState::Failed) =>
                {
                    tracing::info!(
                        request_id = %request_id,
                        state = ?report.state,
                        attempts = report.attempts,
                        transport = report.current_transport.as_deref().unwrap_or("-"),
                        "demo message settled"
                    );
                    break;
                }
                Some(_) => tokio::time::sleep(Duration::from_millis(100)).await,
                None => break,
            }
        }
    }

    let stats = engine.queue_stats();
    tracing::info!(
        completed = stats.completed,
        failed = stats.failed,
        queue_retries = stats.queue_retries,
        "demo batch settled"
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let config = load_config(CONFIG_PATH)?;
    println!("{}", toml::to_string(&config)?);

    let primary: Arc<dyn Transport> =
        Arc::new(MockTransport::new("primary", config.primary.clone()));
    let secondary: Arc<dyn Transport> =
        Arc::new(MockTransport::new("secondary", config.secondary.clone()));

    let engine = DeliveryEngine::start(config.engine, primary, secondary);

    seed_demo(&engine, config.demo_messages).await;

    internal!(level = INFO, "herald running, ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    println!("Shutting down...");
    engine.shutdown(Duration::from_secs(5)).await;

    Ok(())
}
