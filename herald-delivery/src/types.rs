//! Internal job representation and caller-facing projection types.

use std::time::{Instant, SystemTime};

use herald_common::MailPayload;
use herald_transport::{DeliveryReceipt, MessageId};
use serde::{Deserialize, Serialize};

use crate::error::ErrorInfo;

/// Engine-unique job identifier (ULID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId {
    id: ulid::Ulid,
}

impl JobId {
    /// Generate a new unique job ID.
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
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl serde::Serialize for JobId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.id.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for JobId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let id = ulid::Ulid::from_string(&s).map_err(serde::de::Error::custom)?;
        Ok(Self { id })
    }
}

/// Lifecycle state of a job inside the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    /// Waiting for a worker (or for its earliest-execution instant).
    Queued,
    /// A worker is attempting it right now.
    Processing,
    /// A queue-level retry is scheduled.
    Retrying,
    /// Terminal: delivered.
    Completed,
    /// Terminal: failed.
    Failed,
}

impl JobStatus {
    /// Whether this state admits no further transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// The internal, queueable representation of a request during processing.
///
/// Owned by the queue from submission to terminal state; workers receive
/// snapshots and report outcomes back through the coordinator.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: JobId,
    /// The caller's idempotency key.
    pub request_id: String,
    pub payload: MailPayload,
    /// Dequeue priority; larger first.
    pub priority: u8,
    /// Earliest instant a worker may pick this job up.
    pub execute_not_before: Instant,
    pub submitted_at: Instant,
    /// Wall-clock mirror of `submitted_at`, for projection output.
    pub submitted_at_wall: SystemTime,
    pub started_at: Option<Instant>,
    pub finished_at: Option<SystemTime>,
    /// Transport attempts consumed so far.
    pub attempts: u32,
    /// Queue-level safety-net retries consumed so far.
    pub queue_retries: u32,
    pub status: JobStatus,
    pub last_error: Option<ErrorInfo>,
    pub result: Option<DeliveryReceipt>,
}

impl Job {
    /// Build a queued job from admission data.
    #[must_use]
    pub fn new(request_id: String, payload: MailPayload, priority: u8, delay_ms: u64) -> Self {
        let now = Instant::now();
        Self {
            job_id: JobId::generate(),
            request_id,
            payload,
            priority,
            execute_not_before: now + std::time::Duration::from_millis(delay_ms),
            submitted_at: now,
            submitted_at_wall: SystemTime::now(),
            started_at: None,
            finished_at: None,
            attempts: 0,
            queue_retries: 0,
            status: JobStatus::Queued,
            last_error: None,
            result: None,
        }
    }
}

/// Queue counters for admin queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Jobs waiting in `Queued` or `Retrying`.
    pub queued: usize,
    /// Jobs currently held by a worker.
    pub processing: usize,
    /// Completed jobs retained in history.
    pub completed: usize,
    /// Failed jobs retained in history.
    pub failed: usize,
    /// Configured worker count.
    pub concurrency: usize,
    /// Whether any worker holds a job right now.
    pub is_processing: bool,
    /// Queue-level safety-net retries fired since start.
    pub queue_retries: u64,
}

/// Accepted submission outcomes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum SubmitOutcome {
    /// Admitted and enqueued for asynchronous delivery.
    Queued { job_id: JobId, request_id: String },
    /// Delivered synchronously (queue disabled).
    Sent { receipt: DeliveryReceipt },
    /// Duplicate of an in-flight request.
    Pending { request_id: String },
    /// Duplicate of a request that already completed.
    CompletedCached { receipt: DeliveryReceipt },
    /// Duplicate of a request that already failed.
    FailedCached { error: ErrorInfo },
}

/// Externally-visible request state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportState {
    Queued,
    Processing,
    Retrying,
    Sent,
    Failed,
    /// Admitted, no job observed yet (synchronous mode in flight).
    Pending,
}

/// Status projection for one request, derived from the lifecycle record
/// and the latest job (the job wins when both exist).
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub request_id: String,
    pub state: ReportState,
    pub attempts: u32,
    pub current_transport: Option<String>,
    pub message_id: Option<MessageId>,
    pub error: Option<ErrorInfo>,
    pub created_at: SystemTime,
    pub last_attempt_at: Option<SystemTime>,
    pub updated_at: SystemTime,
}
