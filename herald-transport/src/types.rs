//! Identifiers and receipts shared across transports.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Identifier a transport assigns to an accepted message.
///
/// A ULID: lexicographically sortable by creation time and
/// collision-resistant across concurrent transports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId {
    id: ulid::Ulid,
}

impl MessageId {
    /// Generate a new unique message ID.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            id: ulid::Ulid::new(),
        }
    }

    /// Get the underlying ULID.
    #[must_use]
    pub const fn ulid(&self) -> ulid::Ulid {
        self.id
    }

    /// Get the timestamp (milliseconds since Unix epoch) encoded in this ID.
    #[must_use]
    pub const fn timestamp_ms(&self) -> u64 {
        self.id.timestamp_ms()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl std::str::FromStr for MessageId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self {
            id: ulid::Ulid::from_string(s)?,
        })
    }
}

impl serde::Serialize for MessageId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.id.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for MessageId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let id = ulid::Ulid::from_string(&s).map_err(serde::de::Error::custom)?;
        Ok(Self { id })
    }
}

/// Proof of one successful send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    /// Identifier the transport assigned to the accepted message.
    pub message_id: MessageId,
    /// Name of the transport that accepted it.
    pub transport: String,
    /// When the transport acknowledged acceptance.
    pub finished_at: SystemTime,
}

impl DeliveryReceipt {
    /// Build a receipt stamped with the current time.
    pub fn now(transport: impl Into<String>) -> Self {
        Self {
            message_id: MessageId::generate(),
            transport: transport.into(),
            finished_at: SystemTime::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_roundtrip() {
        let id = MessageId::generate();
        let parsed: MessageId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_message_ids_unique_and_sortable() {
        let a = MessageId::generate();
        let b = MessageId::generate();
        assert_ne!(a, b);
        // ULIDs generated later never sort before earlier ones.
        assert!(a <= b);
    }

    #[test]
    fn test_receipt_names_transport() {
        let receipt = DeliveryReceipt::now("primary");
        assert_eq!(receipt.transport, "primary");
        assert!(receipt.finished_at <= SystemTime::now());
    }
}
