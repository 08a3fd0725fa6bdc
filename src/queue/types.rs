use crate::error::{ErrorKind, SyncError};
use crate::types::{Document, RecordVersion};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Create => write!(f, "create"),
            OperationKind::Update => write!(f, "update"),
            OperationKind::Delete => write!(f, "delete"),
        }
    }
}

impl std::str::FromStr for OperationKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" | "insert" => Ok(OperationKind::Create),
            "update" => Ok(OperationKind::Update),
            "delete" => Ok(OperationKind::Delete),
            other => Err(SyncError::Validation(format!(
                "unknown operation kind '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InFlight,
    Committed,
    RetryScheduled,
    PermanentlyFailed,
}

impl OperationStatus {
    /// Counted as pending work: `pending`, `retry_scheduled`, `in_flight`.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OperationStatus::Pending | OperationStatus::InFlight | OperationStatus::RetryScheduled
        )
    }
}

/// One durable pending mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuedOperation {
    pub sequence: u64,
    pub collection: String,
    pub document_id: String,
    pub kind: OperationKind,
    #[serde(default)]
    pub payload: Document,
    pub idempotency_key: String,
    /// Remote version the local mutation was based on
    pub base_version: Option<String>,
    pub base_modified_at: Option<i64>,
    /// Time of the latest local write folded into this entry, unix millis
    pub local_timestamp: i64,
    pub retry_count: u32,
    pub status: OperationStatus,
    /// Set once a remote call has been issued for this entry
    #[serde(default)]
    pub attempted: bool,
    pub next_attempt_at: Option<i64>,
    pub first_failed_at: Option<i64>,
    pub last_error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub created_at: i64,
}

impl QueuedOperation {
    pub(crate) fn new(
        sequence: u64,
        collection: &str,
        document_id: &str,
        kind: OperationKind,
        payload: Document,
        base: Option<RecordVersion>,
        now: i64,
    ) -> Self {
        let (base_version, base_modified_at) = match base {
            Some(v) => (Some(v.version), v.modified_at),
            None => (None, None),
        };
        Self {
            sequence,
            collection: collection.to_string(),
            document_id: document_id.to_string(),
            kind,
            payload,
            idempotency_key: uuid::Uuid::new_v4().to_string(),
            base_version,
            base_modified_at,
            local_timestamp: now,
            retry_count: 0,
            status: OperationStatus::Pending,
            attempted: false,
            next_attempt_at: None,
            first_failed_at: None,
            last_error: None,
            error_kind: None,
            created_at: now,
        }
    }

    pub fn targets(&self, collection: &str, document_id: &str) -> bool {
        self.collection == collection && self.document_id == document_id
    }

    /// Pending and never sent: safe to coalesce into or cancel.
    pub fn is_fresh(&self) -> bool {
        self.status == OperationStatus::Pending && !self.attempted
    }

    pub fn base(&self) -> Option<RecordVersion> {
        self.base_version.as_ref().map(|version| RecordVersion {
            version: version.clone(),
            modified_at: self.base_modified_at,
        })
    }

    pub(crate) fn payload_bytes(&self) -> usize {
        serde_json::to_vec(&self.payload).map(|v| v.len()).unwrap_or(0)
    }
}

/// What `enqueue` did with a new mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Appended as a new entry
    Appended(u64),
    /// Merged into an existing pending entry
    Coalesced(u64),
    /// A never-committed create was cancelled together with this delete
    Cancelled { removed: Vec<u64> },
}

impl EnqueueOutcome {
    pub fn sequence(&self) -> Option<u64> {
        match self {
            EnqueueOutcome::Appended(seq) | EnqueueOutcome::Coalesced(seq) => Some(*seq),
            EnqueueOutcome::Cancelled { .. } => None,
        }
    }
}

/// Configuration for the offline queue bounds
///
/// When the queue is full (either by count or bytes), new changes are
/// rejected rather than dropping queued ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of queued entries (default: 10,000)
    pub max_count: usize,
    /// Maximum total size in bytes of queued payloads (default: 100MB)
    pub max_bytes: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_count: 10_000,
            max_bytes: 100 * 1024 * 1024,
        }
    }
}

impl QueueConfig {
    pub fn new(max_count: usize, max_bytes: usize) -> Self {
        Self {
            max_count,
            max_bytes,
        }
    }

    /// Limits for field devices
    pub fn mobile() -> Self {
        Self {
            max_count: 1_000,
            max_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Queue statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Entries counted as pending work
    pub active: usize,
    pub permanently_failed: usize,
    /// Total size in bytes of queued payloads
    pub bytes: usize,
}

/// Exponential backoff with a cap, a retry limit and a total duration limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub max_retries: u32,
    pub max_retry_duration_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_base_ms: 1_000,
            backoff_cap_ms: 5 * 60 * 1_000,
            max_retries: 5,
            max_retry_duration_secs: 60 * 60,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt number `retry_count + 1`: base * 2^(retry_count - 1), capped.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(63);
        let factor = 1u64 << exponent;
        let delay = self.backoff_base_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.backoff_cap_ms))
    }

    /// Whether an operation that has failed `retry_count` times, first at
    /// `first_failed_at`, has used up its budget.
    pub fn exhausted(&self, retry_count: u32, first_failed_at: i64, now: i64) -> bool {
        let elapsed_ms = now.saturating_sub(first_failed_at).max(0) as u64;
        retry_count >= self.max_retries
            || elapsed_ms >= self.max_retry_duration_secs.saturating_mul(1_000)
    }
}
