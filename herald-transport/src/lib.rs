#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

pub mod error;
pub mod mock;
pub mod transport;
pub mod types;

pub use error::{FailureKind, TransportFailure};
pub use mock::{MockBehavior, MockTransport, ScriptedOutcome, ScriptedTransport};
pub use transport::Transport;
pub use types::{DeliveryReceipt, MessageId};
