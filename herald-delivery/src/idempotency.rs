//! TTL-expiring idempotency store, one lifecycle record per request id.
//!
//! `begin_or_get` is the single atomic admission point: two concurrent
//! submissions with the same request id cannot both observe `Fresh`. A
//! record that has reached `Completed` or `Failed` is terminal; later
//! terminal calls keep the first value. Expired records are treated as
//! absent on admission; the sweep is background compaction, not the
//! correctness mechanism.

use std::time::{Duration, SystemTime};

use dashmap::{DashMap, mapref::entry::Entry};
use herald_common::tracing;
use herald_transport::DeliveryReceipt;
use serde::{Deserialize, Serialize};

use crate::error::ErrorInfo;

/// Configuration for the idempotency store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// Lifetime of a record from creation.
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,

    /// Interval of the background expiry sweep.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_ttl_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

const fn default_ttl_ms() -> u64 {
    86_400_000 // 24 hours
}

const fn default_sweep_interval_ms() -> u64 {
    60_000
}

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordStatus {
    Pending,
    Completed,
    Failed,
}

/// The per-request entry in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleRecord {
    pub request_id: String,
    pub status: RecordStatus,
    /// Total transport attempts observed so far.
    pub attempts: u32,
    pub current_transport: Option<String>,
    pub last_attempt_at: Option<SystemTime>,
    /// Terminal success payload.
    pub result: Option<DeliveryReceipt>,
    /// Terminal failure payload.
    pub error: Option<ErrorInfo>,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
    pub expires_at: SystemTime,
}

impl LifecycleRecord {
    fn new(request_id: &str, now: SystemTime, ttl: Duration) -> Self {
        Self {
            request_id: request_id.to_string(),
            status: RecordStatus::Pending,
            attempts: 0,
            current_transport: None,
            last_attempt_at: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
        }
    }

    /// Whether this record has reached a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self.status, RecordStatus::Completed | RecordStatus::Failed)
    }
}

/// Result of an admission attempt.
#[derive(Debug, Clone)]
pub enum Admission {
    /// No live record existed; one was created in `Pending`.
    Fresh(LifecycleRecord),
    /// A live record already exists; its snapshot is returned.
    Existing(LifecycleRecord),
}

/// In-process idempotency store keyed by request id.
#[derive(Debug)]
pub struct IdempotencyStore {
    ttl: Duration,
    records: DashMap<String, LifecycleRecord>,
}

impl IdempotencyStore {
    #[must_use]
    pub fn new(config: &IdempotencyConfig) -> Self {
        Self {
            ttl: Duration::from_millis(config.ttl_ms),
            records: DashMap::new(),
        }
    }

    /// Atomically create a pending record for `request_id`, or return the
    /// live one. An expired record counts as absent and is replaced.
    pub fn begin_or_get(&self, request_id: &str) -> Admission {
        let now = SystemTime::now();
        match self.records.entry(request_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at > now {
                    Admission::Existing(occupied.get().clone())
                } else {
                    let record = LifecycleRecord::new(request_id, now, self.ttl);
                    occupied.insert(record.clone());
                    Admission::Fresh(record)
                }
            }
            Entry::Vacant(vacant) => {
                let record = LifecycleRecord::new(request_id, now, self.ttl);
                vacant.insert(record.clone());
                Admission::Fresh(record)
            }
        }
    }

    /// Record the start of one transport attempt.
    pub fn mark_attempt(&self, request_id: &str, transport: &str, at: SystemTime) {
        if let Some(mut record) = self.records.get_mut(request_id) {
            if record.is_terminal() {
                return;
            }
            record.attempts += 1;
            record.current_transport = Some(transport.to_string());
            record.last_attempt_at = Some(at);
            record.updated_at = at;
        }
    }

    /// Terminal success transition. Idempotent: the first terminal value
    /// wins.
    pub fn complete(&self, request_id: &str, receipt: DeliveryReceipt) {
        if let Some(mut record) = self.records.get_mut(request_id) {
            if record.is_terminal() {
                return;
            }
            record.status = RecordStatus::Completed;
            record.result = Some(receipt);
            record.updated_at = SystemTime::now();
        }
    }

    /// Terminal failure transition. Idempotent: the first terminal value
    /// wins.
    pub fn fail(&self, request_id: &str, error: ErrorInfo) {
        if let Some(mut record) = self.records.get_mut(request_id) {
            if record.is_terminal() {
                return;
            }
            record.status = RecordStatus::Failed;
            record.error = Some(error);
            record.updated_at = SystemTime::now();
        }
    }

    /// Fetch a snapshot of the record for `request_id`.
    pub fn get(&self, request_id: &str) -> Option<LifecycleRecord> {
        self.records
            .get(request_id)
            .map(|record| record.value().clone())
    }

    /// Remove records whose `expires_at` has passed. Returns how many
    /// were removed.
    pub fn sweep_expired(&self, now: SystemTime) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| record.expires_at >= now);
        let removed = before - self.records.len();
        if removed > 0 {
            tracing::debug!(removed, "swept expired idempotency records");
        }
        removed
    }

    /// Drop every record. Admin/test hook.
    pub fn clear(&self) {
        self.records.clear();
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use herald_transport::DeliveryReceipt;

    use super::*;

    fn store() -> IdempotencyStore {
        IdempotencyStore::new(&IdempotencyConfig::default())
    }

    fn error() -> ErrorInfo {
        ErrorInfo::new(crate::error::ErrorKind::Fatal, "AUTHENTICATION_FAILED", "bad key")
    }

    #[test]
    fn test_begin_then_get_existing() {
        let store = store();

        let Admission::Fresh(record) = store.begin_or_get("r1") else {
            panic!("expected fresh admission");
        };
        assert_eq!(record.status, RecordStatus::Pending);
        assert_eq!(record.attempts, 0);

        let Admission::Existing(record) = store.begin_or_get("r1") else {
            panic!("expected existing admission");
        };
        assert_eq!(record.status, RecordStatus::Pending);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_mark_attempt_updates_record() {
        let store = store();
        store.begin_or_get("r1");

        let at = SystemTime::now();
        store.mark_attempt("r1", "primary", at);
        store.mark_attempt("r1", "secondary", at);

        let record = store.get("r1").unwrap();
        assert_eq!(record.attempts, 2);
        assert_eq!(record.current_transport.as_deref(), Some("secondary"));
        assert_eq!(record.last_attempt_at, Some(at));
    }

    #[test]
    fn test_first_terminal_value_wins() {
        let store = store();
        store.begin_or_get("r1");

        let receipt = DeliveryReceipt::now("primary");
        store.complete("r1", receipt.clone());
        store.fail("r1", error());
        store.complete("r1", DeliveryReceipt::now("secondary"));

        let record = store.get("r1").unwrap();
        assert_eq!(record.status, RecordStatus::Completed);
        assert_eq!(record.result.unwrap().message_id, receipt.message_id);
        assert!(record.error.is_none());
    }

    #[test]
    fn test_terminal_record_ignores_attempts() {
        let store = store();
        store.begin_or_get("r1");
        store.fail("r1", error());

        store.mark_attempt("r1", "primary", SystemTime::now());
        let record = store.get("r1").unwrap();
        assert_eq!(record.attempts, 0);
        assert_eq!(record.status, RecordStatus::Failed);
    }

    #[test]
    fn test_sweep_removes_exactly_expired() {
        let store = store();
        store.begin_or_get("r1");
        store.begin_or_get("r2");

        // Nothing expires at the current time.
        assert_eq!(store.sweep_expired(SystemTime::now()), 0);
        assert_eq!(store.len(), 2);

        // Everything expires one TTL past creation.
        let later = SystemTime::now() + Duration::from_millis(default_ttl_ms() + 1_000);
        assert_eq!(store.sweep_expired(later), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn test_expired_record_is_replaced_on_admission() {
        let config = IdempotencyConfig {
            ttl_ms: 0,
            sweep_interval_ms: 60_000,
        };
        let store = IdempotencyStore::new(&config);

        store.begin_or_get("r1");
        store.fail("r1", error());

        // TTL zero: the terminal record is already expired, so the same
        // request id admits fresh again.
        let Admission::Fresh(record) = store.begin_or_get("r1") else {
            panic!("expected fresh admission after expiry");
        };
        assert_eq!(record.status, RecordStatus::Pending);
    }

    #[test]
    fn test_clear() {
        let store = store();
        store.begin_or_get("r1");
        store.begin_or_get("r2");
        store.clear();
        assert!(store.is_empty());
        assert!(store.get("r1").is_none());
    }
}
