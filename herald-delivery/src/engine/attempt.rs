//! The per-job attempt loop: bounded retry with exponential backoff on
//! each transport, fallback across transports, terminal recording.
//!
//! Decision table per failure kind:
//! - `PermanentGlobal`: record failure, stop everything
//! - `PermanentLocal`: abandon this transport, try the next
//! - `Transient`/`RateLimited`: retry here until the per-transport cap,
//!   sleeping `retry_after` when the failure carries one, the backoff
//!   schedule otherwise; then fall through to the next transport
//!
//! A breaker short-circuit is a `Transient` failure with code
//! `CIRCUIT_OPEN`; waiting out its `retry_after` inside the loop would
//! stall the job for the whole open window, so it falls through to the
//! next transport immediately.

use std::time::{Duration, SystemTime};

use herald_common::tracing;
use herald_transport::{FailureKind, TransportFailure};

use super::DeliveryEngine;
use crate::{
    error::{CIRCUIT_OPEN, ErrorInfo, ErrorKind},
    queue::{AttemptReport, Disposition, RunnerError},
    types::Job,
};

impl DeliveryEngine {
    /// Run the full attempt sequence for one job.
    ///
    /// Terminal outcomes are written to the idempotency store before this
    /// returns, so the projection never lags the report.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Interrupted`] when shutdown fires during a
    /// backoff sleep; the queue requeues the job without consuming a
    /// safety-net retry.
    pub(crate) async fn attempt(&self, job: &Job) -> Result<AttemptReport, RunnerError> {
        let request_id = &job.request_id;
        let max_attempts = self.config.max_attempts_per_transport;
        let max_delay = Duration::from_millis(self.config.max_retry_delay_ms);
        let mut shutdown = self.shutdown.subscribe();

        let mut attempts = job.attempts;
        let mut last_failure: Option<TransportFailure> = None;

        'transports: for transport in &self.transports {
            let name = transport.name().to_string();
            let mut delay = Duration::from_millis(self.config.initial_retry_delay_ms);
            let mut n = 0;

            while n < max_attempts {
                n += 1;
                attempts += 1;
                self.store
                    .mark_attempt(request_id, &name, SystemTime::now());
                tracing::debug!(
                    request_id = %request_id,
                    transport = %name,
                    attempt = n,
                    total_attempts = attempts,
                    "attempting delivery"
                );

                let outcome = if self.config.enable_breaker {
                    self.breakers.run(transport, &job.payload).await
                } else {
                    transport.send(&job.payload).await
                };

                let failure = match outcome {
                    Ok(receipt) => {
                        self.store.complete(request_id, receipt.clone());
                        tracing::info!(
                            request_id = %request_id,
                            transport = %name,
                            message_id = %receipt.message_id,
                            attempts,
                            "delivered"
                        );
                        return Ok(AttemptReport {
                            disposition: Disposition::Delivered(receipt),
                            attempts,
                        });
                    }
                    Err(failure) => failure,
                };

                tracing::debug!(
                    request_id = %request_id,
                    transport = %name,
                    kind = ?failure.kind,
                    code = %failure.code,
                    "attempt failed"
                );

                match failure.kind {
                    FailureKind::PermanentGlobal => {
                        let error = ErrorInfo::from(&failure);
                        self.store.fail(request_id, error.clone());
                        tracing::warn!(
                            request_id = %request_id,
                            code = %error.code,
                            "fatal rejection, no fallback"
                        );
                        return Ok(AttemptReport {
                            disposition: Disposition::Rejected(error),
                            attempts,
                        });
                    }
                    FailureKind::PermanentLocal => {
                        last_failure = Some(failure);
                        continue 'transports;
                    }
                    FailureKind::Transient | FailureKind::RateLimited => {
                        let short_circuit = failure.code == CIRCUIT_OPEN;
                        let wait = failure.retry_after.unwrap_or(delay);
                        last_failure = Some(failure);

                        if short_circuit || n == max_attempts {
                            continue 'transports;
                        }

                        tokio::select! {
                            () = tokio::time::sleep(wait) => {}
                            _ = shutdown.recv() => return Err(RunnerError::Interrupted),
                        }
                        delay = delay
                            .saturating_mul(self.config.retry_multiplier)
                            .min(max_delay);
                    }
                }
            }
        }

        let error = last_failure.as_ref().map_or_else(
            || {
                ErrorInfo::new(
                    ErrorKind::Exhausted,
                    "EXHAUSTED",
                    "all transports and attempts consumed",
                )
            },
            ErrorInfo::exhausted,
        );
        self.store.fail(request_id, error.clone());
        tracing::warn!(
            request_id = %request_id,
            attempts,
            code = %error.code,
            "all transports exhausted"
        );
        Ok(AttemptReport {
            disposition: Disposition::Rejected(error),
            attempts,
        })
    }
}
