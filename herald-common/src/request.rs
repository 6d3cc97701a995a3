//! Caller-facing delivery request and its validation rules.
//!
//! A [`SendRequest`] is the unit of admission: it carries the message
//! payload, the caller's idempotency key, and scheduling hints. Validation
//! reports every offending field rather than stopping at the first, so a
//! front end can surface the complete list in one response.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum length of the subject line, in characters.
pub const MAX_SUBJECT_LEN: usize = 200;
/// Maximum length of the message body, in characters.
pub const MAX_BODY_LEN: usize = 10_000;
/// Maximum length of the caller-supplied request identifier.
pub const MAX_REQUEST_ID_LEN: usize = 100;
/// Highest accepted priority. Priorities order dequeueing, larger first.
pub const MAX_PRIORITY: u8 = 10;
/// Maximum accepted submission delay.
pub const MAX_DELAY_MS: u64 = 300_000;

/// A request to deliver one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    /// Recipient address.
    pub to: String,

    /// Subject line, 1..=200 characters.
    pub subject: String,

    /// Message body, 1..=10 000 characters.
    pub body: String,

    /// Caller-unique idempotency key, 1..=100 characters.
    pub request_id: String,

    /// Dequeue priority, 0..=10. Larger values are dequeued first.
    #[serde(default)]
    pub priority: u8,

    /// Earliest-execution delay in milliseconds, 0..=300 000.
    #[serde(default)]
    pub delay_ms: u64,
}

impl SendRequest {
    /// Check the request against the admission rules.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationErrors`] listing every field that failed.
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = Vec::new();

        if !is_valid_address(&self.to) {
            errors.push(FieldError::new("to", "not a valid email address"));
        }

        let subject_len = self.subject.chars().count();
        if subject_len == 0 || subject_len > MAX_SUBJECT_LEN {
            errors.push(FieldError::new(
                "subject",
                format!("length must be 1..={MAX_SUBJECT_LEN} characters"),
            ));
        }

        let body_len = self.body.chars().count();
        if body_len == 0 || body_len > MAX_BODY_LEN {
            errors.push(FieldError::new(
                "body",
                format!("length must be 1..={MAX_BODY_LEN} characters"),
            ));
        }

        let id_len = self.request_id.chars().count();
        if id_len == 0 || id_len > MAX_REQUEST_ID_LEN {
            errors.push(FieldError::new(
                "request_id",
                format!("length must be 1..={MAX_REQUEST_ID_LEN} characters"),
            ));
        }

        if self.priority > MAX_PRIORITY {
            errors.push(FieldError::new(
                "priority",
                format!("must be 0..={MAX_PRIORITY}"),
            ));
        }

        if self.delay_ms > MAX_DELAY_MS {
            errors.push(FieldError::new(
                "delay_ms",
                format!("must be 0..={MAX_DELAY_MS}"),
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors { fields: errors })
        }
    }

    /// Extract the message payload handed to transports.
    pub fn payload(&self) -> MailPayload {
        MailPayload {
            to: self.to.clone(),
            subject: self.subject.clone(),
            body: self.body.clone(),
        }
    }
}

/// The message content handed to a transport, detached from scheduling
/// metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailPayload {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Written as an alias (rather than spelling `&'static str` directly on the
/// field below) so `derive(Deserialize)` doesn't pin `FieldError`'s impl to
/// the concrete `'static` lifetime instead of a generic `'de` — which would
/// then make `Vec<FieldError>` fail to implement `Deserialize<'de>` for
/// `ValidationErrors`. See the `field_name` module for the matching
/// `with` shim, which interns the deserialized string back into one of the
/// known `&'static str` field names.
type FieldName = &'static str;

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Name of the offending request field.
    #[serde(with = "field_name")]
    pub field: FieldName,
    /// Human-readable reason.
    pub message: String,
}

/// `&'static str` can't derive `Deserialize` directly (there is no lifetime
/// to borrow into), so field names are interned through this fixed lookup
/// table instead.
mod field_name {
    use super::FieldName;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    const KNOWN: &[&str] = &["to", "subject", "body", "request_id", "priority", "delay_ms"];

    pub fn serialize<S: Serializer>(value: &FieldName, serializer: S) -> Result<S::Ok, S::Error> {
        value.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<FieldName, D::Error> {
        let value = String::deserialize(deserializer)?;
        KNOWN
            .iter()
            .copied()
            .find(|known| *known == value)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown field name: {value}")))
    }
}

impl FieldError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// The complete set of validation failures for one request.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("invalid request: {}", self.describe())]
pub struct ValidationErrors {
    pub fields: Vec<FieldError>,
}

impl ValidationErrors {
    fn describe(&self) -> String {
        self.fields
            .iter()
            .map(|f| f.field)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// RFC-basic address shape: exactly one `@`, a non-empty local part, and a
/// dotted non-empty domain. Full RFC 5321 parsing is a transport concern.
fn is_valid_address(address: &str) -> bool {
    if address.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return false;
    }

    let mut parts = address.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };

    if local.is_empty() || domain.is_empty() {
        return false;
    }

    domain.split('.').count() >= 2 && domain.split('.').all(|label| !label.is_empty())
}
