//! The transport contract.

use async_trait::async_trait;
use herald_common::MailPayload;

use crate::{error::TransportFailure, types::DeliveryReceipt};

/// One send capability, e.g. a provider API client.
///
/// Implementations own all side effects; the engine only sees the typed
/// outcome. A transport must be safe to call from concurrent workers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Stable name used for breaker state, receipts, and logging.
    fn name(&self) -> &str;

    /// Attempt one send.
    ///
    /// # Errors
    ///
    /// Returns a classified [`TransportFailure`]; the engine decides
    /// retry/fallback from its `kind`.
    async fn send(&self, payload: &MailPayload) -> Result<DeliveryReceipt, TransportFailure>;

    /// Lightweight liveness probe. Transports that cannot tell report
    /// healthy.
    async fn health_check(&self) -> bool {
        true
    }
}
