//! Service trait abstraction over the engine's query and admin surface.
//!
//! Front ends (HTTP, CLI, control sockets) depend on this trait instead
//! of the concrete engine, keeping them mockable and decoupled from the
//! delivery internals.

use crate::{
    circuit_breaker::BreakerStatus,
    engine::DeliveryEngine,
    types::{QueueStats, StatusReport},
};

/// Query and admin operations exposed to external collaborators.
pub trait StatusService: Send + Sync {
    /// Status projection for one request; `None` when the request id is
    /// unknown.
    fn status(&self, request_id: &str) -> Option<StatusReport>;

    /// Queue counters.
    fn queue_stats(&self) -> QueueStats;

    /// Snapshot of one transport's breaker.
    fn breaker_status(&self, transport: &str) -> BreakerStatus;

    /// Reset one breaker, or all when `transport` is `None`.
    fn reset_breaker(&self, transport: Option<&str>);

    /// Force one breaker open.
    fn force_open_breaker(&self, transport: &str);

    /// Drop every idempotency record. Test hook.
    fn clear_idempotency(&self);
}

impl StatusService for DeliveryEngine {
    fn status(&self, request_id: &str) -> Option<StatusReport> {
        Self::status(self, request_id)
    }

    fn queue_stats(&self) -> QueueStats {
        Self::queue_stats(self)
    }

    fn breaker_status(&self, transport: &str) -> BreakerStatus {
        Self::breaker_status(self, transport)
    }

    fn reset_breaker(&self, transport: Option<&str>) {
        Self::reset_breaker(self, transport);
    }

    fn force_open_breaker(&self, transport: &str) {
        Self::force_open_breaker(self, transport);
    }

    fn clear_idempotency(&self) {
        Self::clear_idempotency(self);
    }
}
