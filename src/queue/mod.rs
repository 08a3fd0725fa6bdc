//! Local operation queue
//!
//! Durable FIFO of pending mutations. Entries are kept in memory ordered by
//! sequence number and written through to `DurableStorage` under the
//! `queue:` prefix. The coordinator is the only caller of the status
//! transitions; producers only call `enqueue`.

pub mod types;

pub use types::{
    EnqueueOutcome, OperationKind, OperationStatus, QueueConfig, QueueStats, QueuedOperation,
    RetryPolicy,
};

use crate::error::{SyncError, SyncResult};
use crate::storage::DurableStorage;
use crate::types::{merge_fields, Document, RecordVersion};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const OP_PREFIX: &str = "queue:op:";
const META_KEY: &str = "queue:meta";

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueMeta {
    next_sequence: u64,
}

fn op_key(sequence: u64) -> String {
    format!("{}{:020}", OP_PREFIX, sequence)
}

pub struct LocalOperationQueue {
    storage: Arc<dyn DurableStorage>,
    config: QueueConfig,
    retry: RetryPolicy,
    next_sequence: AtomicU64,
    ops: Mutex<BTreeMap<u64, QueuedOperation>>,
    active: AtomicUsize,
    fault: parking_lot::Mutex<Option<String>>,
}

impl LocalOperationQueue {
    pub fn new(storage: Arc<dyn DurableStorage>, config: QueueConfig, retry: RetryPolicy) -> Self {
        Self {
            storage,
            config,
            retry,
            next_sequence: AtomicU64::new(1),
            ops: Mutex::new(BTreeMap::new()),
            active: AtomicUsize::new(0),
            fault: parking_lot::Mutex::new(None),
        }
    }

    /// Restore queued entries from durable storage.
    pub async fn load(&self) -> SyncResult<usize> {
        let mut ops = self.ops.lock().await;
        ops.clear();

        for (key, raw) in self.storage.list(OP_PREFIX).await? {
            match serde_json::from_slice::<QueuedOperation>(&raw) {
                Ok(op) if op.status != OperationStatus::Committed => {
                    ops.insert(op.sequence, op);
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Skipping corrupted queue entry {}: {}", key, e);
                }
            }
        }

        let meta: QueueMeta = match self.storage.get(META_KEY).await? {
            Some(raw) => serde_json::from_slice(&raw).unwrap_or_default(),
            None => QueueMeta::default(),
        };
        let after_last = ops.keys().next_back().map(|s| s + 1).unwrap_or(1);
        let next = meta.next_sequence.max(after_last).max(1);
        self.next_sequence.store(next, Ordering::SeqCst);

        self.refresh_active(&ops);
        info!(
            "Loaded {} queued operations (next sequence {})",
            ops.len(),
            next
        );
        Ok(ops.len())
    }

    /// Queue a local mutation, applying the coalescing and cancellation rules.
    pub async fn enqueue(
        &self,
        collection: &str,
        document_id: &str,
        kind: OperationKind,
        payload: Document,
        base: Option<RecordVersion>,
    ) -> SyncResult<EnqueueOutcome> {
        self.ensure_healthy().await?;

        let mut ops = self.ops.lock().await;
        let now = crate::types::now_millis();

        let latest = ops
            .values()
            .rev()
            .find(|op| op.targets(collection, document_id))
            .cloned();

        let outcome = match (kind, latest) {
            (OperationKind::Delete, Some(create))
                if create.kind == OperationKind::Create && create.is_fresh() =>
            {
                let removed: Vec<u64> = ops
                    .range(create.sequence..)
                    .filter(|(_, op)| op.targets(collection, document_id))
                    .map(|(seq, _)| *seq)
                    .collect();

                let mut snapshot = Vec::with_capacity(removed.len());
                for seq in &removed {
                    if let Some(op) = ops.remove(seq) {
                        snapshot.push(op);
                    }
                }

                for seq in &removed {
                    if let Err(e) = self.storage.delete(&op_key(*seq)).await {
                        for op in snapshot {
                            ops.insert(op.sequence, op);
                        }
                        return Err(self.record_fault(e));
                    }
                }

                debug!(
                    "Cancelled never-synced create of {}/{} ({} entries)",
                    collection,
                    document_id,
                    removed.len()
                );
                EnqueueOutcome::Cancelled { removed }
            }
            (OperationKind::Update, Some(existing))
                if matches!(existing.kind, OperationKind::Create | OperationKind::Update)
                    && existing.is_fresh() =>
            {
                let mut merged = existing.clone();
                merge_fields(&mut merged.payload, &payload);
                merged.local_timestamp = now;

                if let Err(e) = self.write_op(&merged).await {
                    return Err(self.record_fault(e));
                }
                ops.insert(merged.sequence, merged);

                debug!(
                    "Coalesced update of {}/{} into #{}",
                    collection, document_id, existing.sequence
                );
                EnqueueOutcome::Coalesced(existing.sequence)
            }
            _ => {
                let bytes: usize = ops.values().map(|op| op.payload_bytes()).sum();
                if ops.len() >= self.config.max_count {
                    return Err(SyncError::QueueFull(format!(
                        "{} entries queued (limit {})",
                        ops.len(),
                        self.config.max_count
                    )));
                }
                let new_bytes = serde_json::to_vec(&payload).map(|v| v.len()).unwrap_or(0);
                if bytes + new_bytes > self.config.max_bytes {
                    return Err(SyncError::QueueFull(format!(
                        "{} payload bytes queued (limit {})",
                        bytes, self.config.max_bytes
                    )));
                }

                let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
                let op = QueuedOperation::new(
                    sequence,
                    collection,
                    document_id,
                    kind,
                    payload,
                    base,
                    now,
                );

                let meta = QueueMeta {
                    next_sequence: sequence + 1,
                };
                let written = match serde_json::to_vec(&meta) {
                    Ok(raw) => self.storage.set(META_KEY, raw).await,
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = written {
                    return Err(self.record_fault(e));
                }
                if let Err(e) = self.write_op(&op).await {
                    return Err(self.record_fault(e));
                }
                ops.insert(sequence, op);

                debug!(
                    "Queued {} of {}/{} as #{}",
                    kind, collection, document_id, sequence
                );
                EnqueueOutcome::Appended(sequence)
            }
        };

        self.refresh_active(&ops);
        Ok(outcome)
    }

    /// The lowest-sequence active entry, if it may be replayed at `now`.
    ///
    /// A retry that is not yet due blocks the queue: later entries never
    /// overtake it.
    pub async fn dequeue_next(&self, now: i64) -> Option<QueuedOperation> {
        let ops = self.ops.lock().await;
        let head = ops.values().find(|op| op.status.is_active())?;
        match head.status {
            OperationStatus::RetryScheduled => match head.next_attempt_at {
                Some(at) if at > now => None,
                _ => Some(head.clone()),
            },
            _ => Some(head.clone()),
        }
    }

    /// When the blocked head of the queue becomes due, if it is waiting.
    pub async fn next_retry_at(&self) -> Option<i64> {
        let ops = self.ops.lock().await;
        let head = ops.values().find(|op| op.status.is_active())?;
        match head.status {
            OperationStatus::RetryScheduled => head.next_attempt_at,
            _ => None,
        }
    }

    pub async fn mark_in_flight(&self, sequence: u64) -> SyncResult<QueuedOperation> {
        self.transition(sequence, |op| {
            op.status = OperationStatus::InFlight;
            op.attempted = true;
            op.next_attempt_at = None;
        })
        .await
    }

    /// Remove a committed entry; returns it with status `committed`.
    pub async fn mark_committed(&self, sequence: u64) -> SyncResult<QueuedOperation> {
        let mut ops = self.ops.lock().await;
        let mut op = ops
            .remove(&sequence)
            .ok_or_else(|| SyncError::NotFound(format!("queued operation #{}", sequence)))?;
        op.status = OperationStatus::Committed;
        self.refresh_active(&ops);

        if let Err(e) = self.storage.delete(&op_key(sequence)).await {
            return Err(self.record_fault(e));
        }
        Ok(op)
    }

    /// Move an entry to the dead-letter state.
    pub async fn mark_failed(&self, sequence: u64, err: &SyncError) -> SyncResult<QueuedOperation> {
        let message = err.to_string();
        let kind = err.kind();
        self.transition(sequence, move |op| {
            op.status = OperationStatus::PermanentlyFailed;
            op.next_attempt_at = None;
            op.last_error = Some(message);
            op.error_kind = Some(kind);
        })
        .await
    }

    /// Schedule another attempt, or dead-letter the entry once the retry
    /// budget is used up.
    pub async fn requeue_with_backoff(
        &self,
        sequence: u64,
        err: &SyncError,
        now: i64,
    ) -> SyncResult<QueuedOperation> {
        let policy = self.retry.clone();
        let message = err.to_string();
        let kind = err.kind();
        let op = self
            .transition(sequence, move |op| {
                op.retry_count += 1;
                let first_failed = *op.first_failed_at.get_or_insert(now);
                op.last_error = Some(message);
                op.error_kind = Some(kind);

                if policy.exhausted(op.retry_count, first_failed, now) {
                    op.status = OperationStatus::PermanentlyFailed;
                    op.next_attempt_at = None;
                } else {
                    op.status = OperationStatus::RetryScheduled;
                    op.next_attempt_at =
                        Some(now + policy.delay_for(op.retry_count).as_millis() as i64);
                }
            })
            .await?;

        if op.status == OperationStatus::PermanentlyFailed {
            warn!(
                "Operation #{} on {}/{} exhausted its retries",
                op.sequence, op.collection, op.document_id
            );
        }
        Ok(op)
    }

    /// Re-capture the base version of every active entry for a document
    /// queued after `after_sequence`.
    pub async fn rebase(
        &self,
        collection: &str,
        document_id: &str,
        after_sequence: u64,
        base: Option<RecordVersion>,
    ) -> SyncResult<()> {
        let mut ops = self.ops.lock().await;
        let (version, modified_at) = match base {
            Some(v) => (Some(v.version), v.modified_at),
            None => (None, None),
        };

        let targets: Vec<u64> = ops
            .range(after_sequence + 1..)
            .filter(|(_, op)| op.targets(collection, document_id) && op.status.is_active())
            .map(|(seq, _)| *seq)
            .collect();

        for seq in targets {
            if let Some(op) = ops.get_mut(&seq) {
                op.base_version = version.clone();
                op.base_modified_at = modified_at;
                let snapshot = op.clone();
                if let Err(e) = self.write_op(&snapshot).await {
                    return Err(self.record_fault(e));
                }
            }
        }
        Ok(())
    }

    /// Operator action: put a dead-lettered entry back in line.
    pub async fn retry_failed(&self, sequence: u64) -> SyncResult<QueuedOperation> {
        {
            let ops = self.ops.lock().await;
            match ops.get(&sequence) {
                Some(op) if op.status == OperationStatus::PermanentlyFailed => {}
                Some(_) => {
                    return Err(SyncError::Validation(format!(
                        "operation #{} is not permanently failed",
                        sequence
                    )))
                }
                None => {
                    return Err(SyncError::NotFound(format!(
                        "queued operation #{}",
                        sequence
                    )))
                }
            }
        }

        self.transition(sequence, |op| {
            op.status = OperationStatus::Pending;
            op.retry_count = 0;
            op.first_failed_at = None;
            op.next_attempt_at = None;
            op.last_error = None;
            op.error_kind = None;
        })
        .await
    }

    /// Operator action: drop a dead-lettered entry.
    pub async fn discard(&self, sequence: u64) -> SyncResult<QueuedOperation> {
        let mut ops = self.ops.lock().await;
        match ops.get(&sequence) {
            Some(op) if op.status == OperationStatus::PermanentlyFailed => {}
            Some(_) => {
                return Err(SyncError::Validation(format!(
                    "operation #{} is not permanently failed",
                    sequence
                )))
            }
            None => {
                return Err(SyncError::NotFound(format!(
                    "queued operation #{}",
                    sequence
                )))
            }
        }

        if let Err(e) = self.storage.delete(&op_key(sequence)).await {
            return Err(self.record_fault(e));
        }
        let op = ops
            .remove(&sequence)
            .ok_or_else(|| SyncError::NotFound(format!("queued operation #{}", sequence)))?;
        self.refresh_active(&ops);
        Ok(op)
    }

    pub async fn get(&self, sequence: u64) -> Option<QueuedOperation> {
        self.ops.lock().await.get(&sequence).cloned()
    }

    /// Active entries for one document, in sequence order.
    pub async fn pending_for(&self, collection: &str, document_id: &str) -> Vec<QueuedOperation> {
        self.ops
            .lock()
            .await
            .values()
            .filter(|op| op.targets(collection, document_id) && op.status.is_active())
            .cloned()
            .collect()
    }

    /// Every retained entry, in sequence order.
    pub async fn operations(&self) -> Vec<QueuedOperation> {
        self.ops.lock().await.values().cloned().collect()
    }

    pub async fn failed_operations(&self) -> Vec<QueuedOperation> {
        self.ops
            .lock()
            .await
            .values()
            .filter(|op| op.status == OperationStatus::PermanentlyFailed)
            .cloned()
            .collect()
    }

    /// Number of entries in `pending`, `retry_scheduled` or `in_flight`.
    pub fn pending_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub async fn stats(&self) -> QueueStats {
        let ops = self.ops.lock().await;
        QueueStats {
            active: ops.values().filter(|op| op.status.is_active()).count(),
            permanently_failed: ops
                .values()
                .filter(|op| op.status == OperationStatus::PermanentlyFailed)
                .count(),
            bytes: ops.values().map(|op| op.payload_bytes()).sum(),
        }
    }

    /// The last storage failure, while the queue is faulted.
    pub fn fault(&self) -> Option<String> {
        self.fault.lock().clone()
    }

    /// Rewrite the whole queue to storage and clear the fault on success.
    pub async fn try_recover(&self) -> SyncResult<()> {
        let ops = self.ops.lock().await;

        let result: SyncResult<()> = async {
            for (key, _) in self.storage.list(OP_PREFIX).await? {
                let keep = key
                    .strip_prefix(OP_PREFIX)
                    .and_then(|s| s.parse::<u64>().ok())
                    .map(|seq| ops.contains_key(&seq))
                    .unwrap_or(false);
                if !keep {
                    self.storage.delete(&key).await?;
                }
            }
            for op in ops.values() {
                self.write_op(op).await?;
            }
            let meta = QueueMeta {
                next_sequence: self.next_sequence.load(Ordering::SeqCst),
            };
            self.storage.set(META_KEY, serde_json::to_vec(&meta)?).await
        }
        .await;

        match result {
            Ok(()) => {
                if self.fault.lock().take().is_some() {
                    info!("Queue storage recovered");
                }
                Ok(())
            }
            Err(e) => Err(self.record_fault(e)),
        }
    }

    async fn ensure_healthy(&self) -> SyncResult<()> {
        if self.fault().is_some() {
            self.try_recover().await?;
        }
        Ok(())
    }

    async fn transition<F>(&self, sequence: u64, apply: F) -> SyncResult<QueuedOperation>
    where
        F: FnOnce(&mut QueuedOperation),
    {
        let mut ops = self.ops.lock().await;
        let op = ops
            .get_mut(&sequence)
            .ok_or_else(|| SyncError::NotFound(format!("queued operation #{}", sequence)))?;
        apply(op);
        let snapshot = op.clone();
        self.refresh_active(&ops);

        if let Err(e) = self.write_op(&snapshot).await {
            return Err(self.record_fault(e));
        }
        Ok(snapshot)
    }

    async fn write_op(&self, op: &QueuedOperation) -> SyncResult<()> {
        let raw = serde_json::to_vec(op)?;
        self.storage.set(&op_key(op.sequence), raw).await
    }

    fn refresh_active(&self, ops: &BTreeMap<u64, QueuedOperation>) {
        let active = ops.values().filter(|op| op.status.is_active()).count();
        self.active.store(active, Ordering::SeqCst);
    }

    fn record_fault(&self, err: SyncError) -> SyncError {
        let err = match err {
            SyncError::Storage(_) => err,
            other => SyncError::Storage(other.to_string()),
        };
        error!("Queue storage failure: {}", err);
        *self.fault.lock() = Some(err.to_string());
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        crate::types::into_document(value).unwrap()
    }

    fn create_queue() -> (LocalOperationQueue, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let queue = LocalOperationQueue::new(
            storage.clone(),
            QueueConfig::default(),
            RetryPolicy {
                backoff_base_ms: 100,
                backoff_cap_ms: 1_000,
                max_retries: 3,
                max_retry_duration_secs: 3600,
            },
        );
        (queue, storage)
    }

    #[tokio::test]
    async fn test_sequences_are_strictly_increasing() {
        let (queue, _) = create_queue();
        let a = queue
            .enqueue("patients", "p1", OperationKind::Create, doc(json!({"n": 1})), None)
            .await
            .unwrap();
        let b = queue
            .enqueue("samples", "s1", OperationKind::Create, doc(json!({"n": 2})), None)
            .await
            .unwrap();

        assert_eq!(a, EnqueueOutcome::Appended(1));
        assert_eq!(b, EnqueueOutcome::Appended(2));
        assert_eq!(queue.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_updates_coalesce_field_by_field() {
        let (queue, _) = create_queue();
        let base = Some(RecordVersion {
            version: "3".into(),
            modified_at: Some(10),
        });
        queue
            .enqueue("samples", "s1", OperationKind::Update, doc(json!({"a": 1})), base.clone())
            .await
            .unwrap();
        let outcome = queue
            .enqueue("samples", "s1", OperationKind::Update, doc(json!({"a": 2, "b": 3})), base)
            .await
            .unwrap();

        assert_eq!(outcome, EnqueueOutcome::Coalesced(1));
        let ops = queue.operations().await;
        assert_eq!(ops.len(), 1);
        assert_eq!(serde_json::Value::Object(ops[0].payload.clone()), json!({"a": 2, "b": 3}));
        assert_eq!(ops[0].base_version.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_update_folds_into_pending_create() {
        let (queue, _) = create_queue();
        queue
            .enqueue("patients", "p1", OperationKind::Create, doc(json!({"name": "Doe"})), None)
            .await
            .unwrap();
        let outcome = queue
            .enqueue("patients", "p1", OperationKind::Update, doc(json!({"age": 40})), None)
            .await
            .unwrap();

        assert_eq!(outcome, EnqueueOutcome::Coalesced(1));
        let ops = queue.operations().await;
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OperationKind::Create);
        assert_eq!(
            serde_json::Value::Object(ops[0].payload.clone()),
            json!({"name": "Doe", "age": 40})
        );
    }

    #[tokio::test]
    async fn test_no_coalescing_into_attempted_entry() {
        let (queue, _) = create_queue();
        queue
            .enqueue("samples", "s1", OperationKind::Update, doc(json!({"a": 1})), None)
            .await
            .unwrap();
        queue.mark_in_flight(1).await.unwrap();
        queue
            .requeue_with_backoff(1, &SyncError::Network("timeout".into()), 0)
            .await
            .unwrap();

        let outcome = queue
            .enqueue("samples", "s1", OperationKind::Update, doc(json!({"a": 2})), None)
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Appended(2));
    }

    #[tokio::test]
    async fn test_create_then_delete_cancels_both() {
        let (queue, storage) = create_queue();
        queue
            .enqueue("patients", "p9", OperationKind::Create, doc(json!({"name": "X"})), None)
            .await
            .unwrap();
        let outcome = queue
            .enqueue("patients", "p9", OperationKind::Delete, Document::new(), None)
            .await
            .unwrap();

        assert_eq!(outcome, EnqueueOutcome::Cancelled { removed: vec![1] });
        assert!(queue.operations().await.is_empty());
        assert_eq!(queue.pending_count(), 0);
        assert!(storage.keys().iter().all(|k| !k.starts_with(OP_PREFIX)));
    }

    #[tokio::test]
    async fn test_delete_after_in_flight_create_is_appended() {
        let (queue, _) = create_queue();
        queue
            .enqueue("patients", "p9", OperationKind::Create, doc(json!({})), None)
            .await
            .unwrap();
        queue.mark_in_flight(1).await.unwrap();

        let outcome = queue
            .enqueue("patients", "p9", OperationKind::Delete, Document::new(), None)
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Appended(2));
    }

    #[tokio::test]
    async fn test_dequeue_is_global_fifo_and_blocks_on_pending_retry() {
        let (queue, _) = create_queue();
        queue
            .enqueue("samples", "s1", OperationKind::Create, doc(json!({})), None)
            .await
            .unwrap();
        queue
            .enqueue("results", "r1", OperationKind::Create, doc(json!({})), None)
            .await
            .unwrap();

        assert_eq!(queue.dequeue_next(0).await.unwrap().sequence, 1);

        queue.mark_in_flight(1).await.unwrap();
        let op = queue
            .requeue_with_backoff(1, &SyncError::Network("down".into()), 1_000)
            .await
            .unwrap();
        assert_eq!(op.status, OperationStatus::RetryScheduled);
        assert_eq!(op.next_attempt_at, Some(1_100));

        assert!(queue.dequeue_next(1_050).await.is_none());
        assert_eq!(queue.next_retry_at().await, Some(1_100));
        assert_eq!(queue.dequeue_next(1_100).await.unwrap().sequence, 1);
    }

    #[tokio::test]
    async fn test_retries_exhaust_into_permanent_failure() {
        let (queue, _) = create_queue();
        queue
            .enqueue("samples", "s1", OperationKind::Create, doc(json!({})), None)
            .await
            .unwrap();
        let err = SyncError::Network("down".into());

        for _ in 0..2 {
            let op = queue.requeue_with_backoff(1, &err, 0).await.unwrap();
            assert_eq!(op.status, OperationStatus::RetryScheduled);
        }
        let op = queue.requeue_with_backoff(1, &err, 0).await.unwrap();
        assert_eq!(op.status, OperationStatus::PermanentlyFailed);
        assert_eq!(queue.pending_count(), 0);
        assert!(queue.dequeue_next(i64::MAX).await.is_none());
        assert_eq!(queue.failed_operations().await.len(), 1);
    }

    #[tokio::test]
    async fn test_permanently_failed_entries_are_skipped() {
        let (queue, _) = create_queue();
        queue
            .enqueue("samples", "s1", OperationKind::Create, doc(json!({})), None)
            .await
            .unwrap();
        queue
            .enqueue("samples", "s2", OperationKind::Create, doc(json!({})), None)
            .await
            .unwrap();
        queue
            .mark_failed(1, &SyncError::Validation("bad".into()))
            .await
            .unwrap();

        assert_eq!(queue.dequeue_next(0).await.unwrap().sequence, 2);

        let retried = queue.retry_failed(1).await.unwrap();
        assert_eq!(retried.status, OperationStatus::Pending);
        assert!(retried.last_error.is_none());
        assert_eq!(queue.dequeue_next(0).await.unwrap().sequence, 1);
    }

    #[tokio::test]
    async fn test_discard_only_applies_to_dead_letters() {
        let (queue, _) = create_queue();
        queue
            .enqueue("samples", "s1", OperationKind::Create, doc(json!({})), None)
            .await
            .unwrap();
        assert!(queue.discard(1).await.is_err());

        queue
            .mark_failed(1, &SyncError::Validation("bad".into()))
            .await
            .unwrap();
        queue.discard(1).await.unwrap();
        assert!(queue.operations().await.is_empty());
    }

    #[tokio::test]
    async fn test_reload_restores_entries_and_sequence() {
        let (queue, storage) = create_queue();
        queue
            .enqueue("samples", "s1", OperationKind::Create, doc(json!({"x": 1})), None)
            .await
            .unwrap();
        queue
            .enqueue("samples", "s2", OperationKind::Create, doc(json!({"x": 2})), None)
            .await
            .unwrap();
        queue.mark_in_flight(1).await.unwrap();
        queue.mark_committed(1).await.unwrap();

        let reopened =
            LocalOperationQueue::new(storage, QueueConfig::default(), RetryPolicy::default());
        assert_eq!(reopened.load().await.unwrap(), 1);
        assert_eq!(reopened.pending_count(), 1);

        let outcome = reopened
            .enqueue("samples", "s3", OperationKind::Create, doc(json!({})), None)
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Appended(3));
    }

    #[tokio::test]
    async fn test_storage_fault_blocks_enqueue_until_recovered() {
        let (queue, storage) = create_queue();
        storage.set_failing(true);

        let err = queue
            .enqueue("samples", "s1", OperationKind::Create, doc(json!({})), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Storage(_)));
        assert!(queue.fault().is_some());
        assert!(queue.operations().await.is_empty());

        storage.set_failing(false);
        queue
            .enqueue("samples", "s1", OperationKind::Create, doc(json!({})), None)
            .await
            .unwrap();
        assert!(queue.fault().is_none());
        assert_eq!(queue.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_count_limit_rejects_new_entries() {
        let storage = Arc::new(MemoryStorage::new());
        let queue =
            LocalOperationQueue::new(storage, QueueConfig::new(1, 1024), RetryPolicy::default());
        queue
            .enqueue("samples", "s1", OperationKind::Create, doc(json!({})), None)
            .await
            .unwrap();

        let err = queue
            .enqueue("samples", "s2", OperationKind::Create, doc(json!({})), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::QueueFull(_)));

        // Coalescing is still allowed on a full queue
        let outcome = queue
            .enqueue("samples", "s1", OperationKind::Update, doc(json!({"a": 1})), None)
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Coalesced(1));
    }

    #[tokio::test]
    async fn test_rebase_updates_later_entries_only() {
        let (queue, _) = create_queue();
        queue
            .enqueue("samples", "s1", OperationKind::Create, doc(json!({})), None)
            .await
            .unwrap();
        queue.mark_in_flight(1).await.unwrap();
        queue
            .enqueue("samples", "s1", OperationKind::Update, doc(json!({"a": 1})), None)
            .await
            .unwrap();

        queue
            .rebase(
                "samples",
                "s1",
                1,
                Some(RecordVersion {
                    version: "1".into(),
                    modified_at: Some(5),
                }),
            )
            .await
            .unwrap();

        let later = queue.get(2).await.unwrap();
        assert_eq!(later.base_version.as_deref(), Some("1"));
        assert_eq!(later.base_modified_at, Some(5));
        assert!(queue.get(1).await.unwrap().base_version.is_none());
    }
}
