#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

pub mod logging;
pub mod request;

pub use request::{FieldError, MailPayload, SendRequest, ValidationErrors};
pub use tracing;

/// Control signal broadcast to long-lived tasks.
#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
    Finalised,
}
