//! Queue replay against the remote store
//!
//! One pass at a time (`try_lock` on the pass lock). Operations are replayed
//! strictly in sequence order; a retryable failure halts the pass so later
//! operations never overtake an earlier one.

use super::conflict::{Conflict, ConflictResolution, ConflictResolvers};
use super::status::{StatusError, SyncStatus, SyncStatusPublisher};
use crate::cache::{CacheStore, RemoteSnapshot};
use crate::error::{SyncError, SyncResult};
use crate::network::NetworkMonitor;
use crate::queue::{LocalOperationQueue, OperationKind, OperationStatus, QueuedOperation};
use crate::remote::{RemoteStore, WriteReceipt};
use crate::storage::DurableStorage;
use crate::types::{now_millis, Document};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const LAST_SUCCESS_KEY: &str = "sync:last_success";

/// How a pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// No replayable operation left
    Completed,
    /// Another pass holds the lock
    AlreadyRunning,
    Offline,
    /// Connectivity dropped mid-pass; the current operation stays in flight
    ConnectivityLost,
    /// The queue head waits for its next attempt
    RetryScheduled { until: i64 },
    /// A durable write failed
    StorageFault,
}

/// Result of one sync pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub outcome: SyncOutcome,
    /// Writes acknowledged by the remote store
    pub pushed: usize,
    /// Interrupted writes found already applied and committed without resending
    pub verified: usize,
    /// Operations dropped without a write (remote won, or already deleted)
    pub skipped: usize,
    pub conflicts_resolved: usize,
    /// Operations moved to the dead-letter state
    pub failed: usize,
    /// Operations scheduled for another attempt
    pub retried: usize,
    pub errors: Vec<String>,
}

impl SyncReport {
    fn new(outcome: SyncOutcome) -> Self {
        Self {
            outcome,
            pushed: 0,
            verified: 0,
            skipped: 0,
            conflicts_resolved: 0,
            failed: 0,
            retried: 0,
            errors: Vec::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.outcome == SyncOutcome::Completed && self.errors.is_empty()
    }
}

enum Step {
    Continue,
    Halt(SyncOutcome),
}

/// Clears the in-progress flag when the pass ends, even by unwinding.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// What a successful replay did remotely
struct Applied {
    snapshot: RemoteSnapshot,
    pushed: bool,
    resolved: bool,
}

impl Applied {
    fn pushed(snapshot: RemoteSnapshot) -> Self {
        Self {
            snapshot,
            pushed: true,
            resolved: false,
        }
    }

    fn skipped(snapshot: RemoteSnapshot) -> Self {
        Self {
            snapshot,
            pushed: false,
            resolved: false,
        }
    }
}

pub struct SyncCoordinator {
    queue: Arc<LocalOperationQueue>,
    cache: Arc<CacheStore>,
    remote: Arc<dyn RemoteStore>,
    monitor: Arc<NetworkMonitor>,
    resolvers: Arc<ConflictResolvers>,
    publisher: Arc<SyncStatusPublisher>,
    storage: Arc<dyn DurableStorage>,
    request_timeout: Duration,
    pass_lock: Mutex<()>,
    in_progress: AtomicBool,
    last_success: parking_lot::Mutex<Option<i64>>,
}

impl SyncCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<LocalOperationQueue>,
        cache: Arc<CacheStore>,
        remote: Arc<dyn RemoteStore>,
        monitor: Arc<NetworkMonitor>,
        resolvers: Arc<ConflictResolvers>,
        publisher: Arc<SyncStatusPublisher>,
        storage: Arc<dyn DurableStorage>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            cache,
            remote,
            monitor,
            resolvers,
            publisher,
            storage,
            request_timeout,
            pass_lock: Mutex::new(()),
            in_progress: AtomicBool::new(false),
            last_success: parking_lot::Mutex::new(None),
        }
    }

    /// Restore the last successful sync time.
    pub async fn load(&self) -> SyncResult<()> {
        if let Some(raw) = self.storage.get(LAST_SUCCESS_KEY).await? {
            let at: i64 = serde_json::from_slice(&raw)?;
            *self.last_success.lock() = Some(at);
        }
        Ok(())
    }

    pub fn last_successful_sync(&self) -> Option<i64> {
        *self.last_success.lock()
    }

    pub fn is_running(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Snapshot of the current state, errors included.
    pub async fn status(&self) -> SyncStatus {
        let mut errors: Vec<StatusError> = self
            .queue
            .failed_operations()
            .await
            .iter()
            .map(StatusError::from_operation)
            .collect();
        if let Some(fault) = self.queue.fault() {
            errors.insert(0, StatusError::storage(fault));
        }
        if let Some(fault) = self.cache.fault() {
            errors.insert(0, StatusError::storage(fault));
        }

        SyncStatus {
            online: self.monitor.is_online(),
            pending_count: self.queue.pending_count(),
            last_successful_sync: self.last_successful_sync(),
            errors,
            in_progress: self.is_running(),
        }
    }

    pub async fn publish_status(&self) {
        let status = self.status().await;
        self.publisher.publish(status);
    }

    /// Fetch the remote copy of one document into the cache. Queued local
    /// mutations stay layered on top.
    pub async fn pull(&self, collection: &str, id: &str) -> SyncResult<Option<Document>> {
        if !self.monitor.is_online() {
            return Err(SyncError::Network("offline".into()));
        }
        let snapshot = match self.call(self.remote.read(collection, id)).await? {
            Some(record) => RemoteSnapshot::Present(record),
            None => RemoteSnapshot::Absent,
        };
        let remaining = self.queue.pending_for(collection, id).await;
        self.cache
            .reconcile(collection, id, snapshot, &remaining)
            .await?;
        Ok(self.cache.get(collection, id))
    }

    /// Run one replay pass. Never fails: problems end up in the report and
    /// in the published status.
    pub async fn sync(&self) -> SyncReport {
        let Ok(_pass) = self.pass_lock.try_lock() else {
            debug!("Sync already in progress");
            return SyncReport::new(SyncOutcome::AlreadyRunning);
        };

        if !self.monitor.is_online() {
            debug!("Offline, skipping sync");
            self.publish_status().await;
            return SyncReport::new(SyncOutcome::Offline);
        }

        let running = PassGuard::enter(&self.in_progress);
        self.publish_status().await;

        let mut report = SyncReport::new(SyncOutcome::Completed);
        report.outcome = self.drain(&mut report).await;

        if report.outcome == SyncOutcome::Completed {
            self.record_success().await;
        }
        drop(running);
        self.publish_status().await;

        info!(
            "Sync pass finished: {:?}, pushed {}, verified {}, skipped {}, conflicts {}, failed {}, retried {}",
            report.outcome,
            report.pushed,
            report.verified,
            report.skipped,
            report.conflicts_resolved,
            report.failed,
            report.retried
        );
        report
    }

    async fn drain(&self, report: &mut SyncReport) -> SyncOutcome {
        loop {
            if self.queue.fault().is_some() {
                if let Err(e) = self.queue.try_recover().await {
                    report.errors.push(e.to_string());
                    return SyncOutcome::StorageFault;
                }
            }

            let Some(op) = self.queue.dequeue_next(now_millis()).await else {
                return match self.queue.next_retry_at().await {
                    Some(until) => SyncOutcome::RetryScheduled { until },
                    None => SyncOutcome::Completed,
                };
            };

            if !self.monitor.is_online() {
                return SyncOutcome::ConnectivityLost;
            }

            match self.replay(op, report).await {
                Step::Continue => continue,
                Step::Halt(outcome) => return outcome,
            }
        }
    }

    async fn replay(&self, op: QueuedOperation, report: &mut SyncReport) -> Step {
        let interrupted = op.attempted || op.status == OperationStatus::InFlight;
        if interrupted {
            match self.call(self.remote.lookup(&op.idempotency_key)).await {
                Ok(Some(receipt)) => {
                    info!(
                        "Operation #{} already applied remotely, committing without resend",
                        op.sequence
                    );
                    report.verified += 1;
                    return self.commit(&op, verified_snapshot(receipt), report).await;
                }
                Ok(None) => debug!("Operation #{} not applied remotely yet", op.sequence),
                Err(e) => return self.fail(&op, e, report).await,
            }
        }

        let op = match self.queue.mark_in_flight(op.sequence).await {
            Ok(op) => op,
            Err(SyncError::NotFound(_)) => {
                debug!("Operation #{} left the queue before replay", op.sequence);
                return Step::Continue;
            }
            Err(e) => return storage_halt(report, e),
        };

        match self.apply(&op).await {
            Ok(applied) => {
                if applied.pushed {
                    report.pushed += 1;
                } else {
                    report.skipped += 1;
                }
                if applied.resolved {
                    report.conflicts_resolved += 1;
                }
                self.commit(&op, applied.snapshot, report).await
            }
            Err(e) => self.fail(&op, e, report).await,
        }
    }

    async fn apply(&self, op: &QueuedOperation) -> SyncResult<Applied> {
        let (collection, id) = (op.collection.as_str(), op.document_id.as_str());

        if op.kind == OperationKind::Create {
            let record = self
                .call(self.remote.create(collection, id, &op.payload, &op.idempotency_key))
                .await?;
            return Ok(Applied::pushed(RemoteSnapshot::Present(record)));
        }

        let current = self.call(self.remote.read(collection, id)).await?;
        let Some(current) = current else {
            return match op.kind {
                OperationKind::Delete => {
                    debug!("{}/{} already deleted remotely", collection, id);
                    Ok(Applied::skipped(RemoteSnapshot::Absent))
                }
                _ => Err(SyncError::Conflict(format!(
                    "{}/{} no longer exists remotely",
                    collection, id
                ))),
            };
        };

        let diverged = op
            .base_version
            .as_ref()
            .is_some_and(|base| base != &current.version);
        if !diverged {
            return self.write(op, &op.payload).await.map(Applied::pushed);
        }

        let resolver = self.resolvers.for_collection(collection);
        info!(
            "Conflict on {}/{} (base {:?}, remote {}), resolving with {}",
            collection,
            id,
            op.base_version,
            current.version,
            resolver.name()
        );
        let conflict = Conflict::new(op, current.clone());
        let resolution = AssertUnwindSafe(resolver.resolve(&conflict))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!("Resolver {} panicked on {}/{}", resolver.name(), collection, id);
                Err(SyncError::Conflict(format!(
                    "{}/{}: resolver {} panicked",
                    collection,
                    id,
                    resolver.name()
                )))
            })?;

        let mut applied = match resolution {
            ConflictResolution::LocalWins => Applied::pushed(self.write(op, &op.payload).await?),
            ConflictResolution::RemoteWins => {
                Applied::skipped(RemoteSnapshot::Present(current))
            }
            ConflictResolution::Merged(merged) => {
                if op.kind == OperationKind::Delete {
                    return Err(SyncError::Conflict(format!(
                        "{}/{}: a merged document cannot resolve a delete",
                        collection, id
                    )));
                }
                Applied::pushed(self.write(op, &merged).await?)
            }
        };
        applied.resolved = true;
        Ok(applied)
    }

    /// Send an update or delete for `op`.
    async fn write(&self, op: &QueuedOperation, payload: &Document) -> SyncResult<RemoteSnapshot> {
        let (collection, id) = (op.collection.as_str(), op.document_id.as_str());
        match op.kind {
            OperationKind::Delete => {
                self.call(self.remote.delete(collection, id, &op.idempotency_key))
                    .await?;
                Ok(RemoteSnapshot::Absent)
            }
            OperationKind::Update | OperationKind::Create => {
                let record = self
                    .call(self.remote.update(collection, id, payload, &op.idempotency_key))
                    .await?;
                Ok(RemoteSnapshot::Present(record))
            }
        }
    }

    async fn commit(
        &self,
        op: &QueuedOperation,
        snapshot: RemoteSnapshot,
        report: &mut SyncReport,
    ) -> Step {
        if let Err(e) = self.queue.mark_committed(op.sequence).await {
            return storage_halt(report, e);
        }

        let base = match &snapshot {
            RemoteSnapshot::Present(record) => Some(record.record_version()),
            RemoteSnapshot::Absent => None,
            RemoteSnapshot::Unchanged => self.cache.version_of(&op.collection, &op.document_id),
        };
        if let Err(e) = self
            .queue
            .rebase(&op.collection, &op.document_id, op.sequence, base)
            .await
        {
            return storage_halt(report, e);
        }

        let remaining = self.queue.pending_for(&op.collection, &op.document_id).await;
        if let Err(e) = self
            .cache
            .reconcile(&op.collection, &op.document_id, snapshot, &remaining)
            .await
        {
            return storage_halt(report, e);
        }

        debug!(
            "Committed #{} ({} {}/{})",
            op.sequence, op.kind, op.collection, op.document_id
        );
        self.publish_status().await;
        Step::Continue
    }

    async fn fail(&self, op: &QueuedOperation, err: SyncError, report: &mut SyncReport) -> Step {
        if err.is_retryable() {
            if !self.monitor.is_online() {
                warn!(
                    "Connectivity lost while replaying #{}, leaving it for re-verification",
                    op.sequence
                );
                return Step::Halt(SyncOutcome::ConnectivityLost);
            }

            let requeued = match self
                .queue
                .requeue_with_backoff(op.sequence, &err, now_millis())
                .await
            {
                Ok(requeued) => requeued,
                Err(e) => return storage_halt(report, e),
            };

            if requeued.status == OperationStatus::RetryScheduled {
                report.retried += 1;
                self.publish_status().await;
                let until = requeued.next_attempt_at.unwrap_or_else(now_millis);
                debug!("Operation #{} retries at {}", op.sequence, until);
                return Step::Halt(SyncOutcome::RetryScheduled { until });
            }
            return self.dead_lettered(op, err, report).await;
        }

        if let Err(e) = self.queue.mark_failed(op.sequence, &err).await {
            return storage_halt(report, e);
        }
        self.dead_lettered(op, err, report).await
    }

    /// Surface a dead-lettered operation and drop it from the optimistic view.
    async fn dead_lettered(&self, op: &QueuedOperation, err: SyncError, report: &mut SyncReport) -> Step {
        warn!(
            "Operation #{} ({} {}/{}) failed permanently: {}",
            op.sequence, op.kind, op.collection, op.document_id, err
        );
        report.failed += 1;
        report.errors.push(format!("#{}: {}", op.sequence, err));

        let remaining = self.queue.pending_for(&op.collection, &op.document_id).await;
        if let Err(e) = self
            .cache
            .reconcile(&op.collection, &op.document_id, RemoteSnapshot::Unchanged, &remaining)
            .await
        {
            return storage_halt(report, e);
        }

        self.publish_status().await;
        Step::Continue
    }

    async fn record_success(&self) {
        let now = now_millis();
        *self.last_success.lock() = Some(now);
        let result = match serde_json::to_vec(&now) {
            Ok(raw) => self.storage.set(LAST_SUCCESS_KEY, raw).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            error!("Failed to persist last sync time: {}", e);
        }
    }

    async fn call<T, F>(&self, fut: F) -> SyncResult<T>
    where
        F: Future<Output = SyncResult<T>>,
    {
        tokio::time::timeout(self.request_timeout, fut).await?
    }
}

fn verified_snapshot(receipt: WriteReceipt) -> RemoteSnapshot {
    match (receipt.kind, receipt.record) {
        (OperationKind::Delete, _) => RemoteSnapshot::Absent,
        (_, Some(record)) => RemoteSnapshot::Present(record),
        (_, None) => RemoteSnapshot::Unchanged,
    }
}

fn storage_halt(report: &mut SyncReport, err: SyncError) -> Step {
    error!("Sync halted on storage failure: {}", err);
    report.errors.push(err.to_string());
    Step::Halt(SyncOutcome::StorageFault)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ManualSignal;
    use crate::queue::{QueueConfig, RetryPolicy};
    use crate::remote::InMemoryRemoteStore;
    use crate::storage::MemoryStorage;
    use crate::sync::conflict::{ConflictResolutionStrategy, FnResolver};
    use serde_json::json;

    struct Harness {
        storage: Arc<MemoryStorage>,
        queue: Arc<LocalOperationQueue>,
        cache: Arc<CacheStore>,
        remote: Arc<InMemoryRemoteStore>,
        signal: Arc<ManualSignal>,
        resolvers: Arc<ConflictResolvers>,
        coordinator: SyncCoordinator,
    }

    fn harness() -> Harness {
        harness_with_timeout(Duration::from_secs(5))
    }

    fn harness_with_timeout(request_timeout: Duration) -> Harness {
        let storage = Arc::new(MemoryStorage::new());
        let retry = RetryPolicy {
            backoff_base_ms: 60_000,
            backoff_cap_ms: 600_000,
            max_retries: 3,
            max_retry_duration_secs: 3_600,
        };
        let queue = Arc::new(LocalOperationQueue::new(
            storage.clone(),
            QueueConfig::default(),
            retry,
        ));
        let cache = Arc::new(CacheStore::new(storage.clone()));
        let remote = Arc::new(InMemoryRemoteStore::new());
        let signal = Arc::new(ManualSignal::new(true));
        let monitor = NetworkMonitor::new(Some(signal.clone()));
        monitor.start();
        let resolvers = Arc::new(ConflictResolvers::default());
        let coordinator = SyncCoordinator::new(
            queue.clone(),
            cache.clone(),
            remote.clone(),
            monitor,
            resolvers.clone(),
            Arc::new(SyncStatusPublisher::new()),
            storage.clone(),
            request_timeout,
        );
        Harness {
            storage,
            queue,
            cache,
            remote,
            signal,
            resolvers,
            coordinator,
        }
    }

    fn doc(value: serde_json::Value) -> Document {
        crate::types::into_document(value).unwrap()
    }

    impl Harness {
        async fn write(&self, collection: &str, id: &str, kind: OperationKind, payload: serde_json::Value) {
            let payload = doc(payload);
            let base = self.cache.version_of(collection, id);
            self.queue
                .enqueue(collection, id, kind, payload.clone(), base)
                .await
                .unwrap();
            self.cache
                .apply_local(collection, id, kind, &payload)
                .await
                .unwrap();
        }

        /// Pull the remote copy into the cache as a synced snapshot.
        async fn pull(&self, collection: &str, id: &str) {
            let record = self.remote.record(collection, id).unwrap();
            self.cache
                .reconcile(collection, id, RemoteSnapshot::Present(record), &[])
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_offline_pass_is_a_noop() {
        let h = harness();
        h.signal.set_online(false);
        h.write("patients", "p1", OperationKind::Create, json!({"name": "Doe"}))
            .await;

        let report = h.coordinator.sync().await;
        assert_eq!(report.outcome, SyncOutcome::Offline);
        assert!(h.remote.calls().is_empty());
        assert_eq!(h.queue.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_pass_is_rejected() {
        let h = harness();
        let _held = h.coordinator.pass_lock.lock().await;
        let report = h.coordinator.sync().await;
        assert_eq!(report.outcome, SyncOutcome::AlreadyRunning);
    }

    #[tokio::test]
    async fn test_create_commits_and_refreshes_cache() {
        let h = harness();
        h.write("patients", "p1", OperationKind::Create, json!({"name": "Doe"}))
            .await;

        let report = h.coordinator.sync().await;
        assert!(report.success());
        assert_eq!(report.pushed, 1);
        assert_eq!(h.queue.pending_count(), 0);

        let record = h.cache.record("patients", "p1").unwrap();
        assert!(!record.dirty);
        assert!(record.version.is_some());
        assert_eq!(record.view().unwrap()["name"], "Doe");
        assert!(h.coordinator.last_successful_sync().is_some());
        assert!(h.storage.keys().contains(&LAST_SUCCESS_KEY.to_string()));
    }

    #[tokio::test]
    async fn test_later_update_is_rebased_after_create() {
        let h = harness();
        h.write("samples", "s1", OperationKind::Create, json!({"status": "new"}))
            .await;
        h.coordinator.sync().await;

        h.write("samples", "s1", OperationKind::Update, json!({"status": "collected"}))
            .await;
        h.write("samples", "s1", OperationKind::Delete, json!({})).await;
        let report = h.coordinator.sync().await;

        assert_eq!(report.conflicts_resolved, 0);
        assert_eq!(report.pushed, 2);
        assert!(h.remote.record("samples", "s1").is_none());
        assert!(h.cache.record("samples", "s1").is_none());
    }

    #[tokio::test]
    async fn test_validation_failure_is_dead_lettered_and_pass_continues() {
        let h = harness();
        h.write("patients", "p1", OperationKind::Create, json!({"name": ""}))
            .await;
        h.write("patients", "p2", OperationKind::Create, json!({"name": "Roe"}))
            .await;
        h.remote
            .fail_next_write(SyncError::Validation("name is required".into()));

        let report = h.coordinator.sync().await;
        assert_eq!(report.outcome, SyncOutcome::Completed);
        assert_eq!(report.failed, 1);
        assert_eq!(report.pushed, 1);
        assert_eq!(h.queue.pending_count(), 0);

        let failed = h.queue.failed_operations().await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].document_id, "p1");
        assert!(h.cache.get("patients", "p1").is_none());

        let status = h.coordinator.status().await;
        assert_eq!(status.errors.len(), 1);
        assert_eq!(status.errors[0].sequence, Some(failed[0].sequence));
    }

    #[tokio::test]
    async fn test_network_failure_schedules_retry_and_halts() {
        let h = harness();
        h.write("patients", "p1", OperationKind::Create, json!({"name": "Doe"}))
            .await;
        h.write("patients", "p2", OperationKind::Create, json!({"name": "Roe"}))
            .await;
        h.remote
            .fail_next_write(SyncError::Network("503 from gateway".into()));

        let report = h.coordinator.sync().await;
        assert!(matches!(report.outcome, SyncOutcome::RetryScheduled { .. }));
        assert_eq!(report.retried, 1);
        assert_eq!(h.remote.count("patients"), 0);
        assert_eq!(h.queue.pending_count(), 2);

        let head = h.queue.operations().await.remove(0);
        assert_eq!(head.status, OperationStatus::RetryScheduled);
        assert_eq!(head.retry_count, 1);

        // The head is not due yet, so nothing may overtake it.
        let report = h.coordinator.sync().await;
        assert!(matches!(report.outcome, SyncOutcome::RetryScheduled { .. }));
        assert_eq!(h.remote.write_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_connectivity_loss_leaves_operation_in_flight() {
        let h = harness();
        h.write("patients", "p1", OperationKind::Create, json!({"name": "Doe"}))
            .await;
        h.remote
            .lose_connection_after_next_write(Some(h.signal.clone()));

        let report = h.coordinator.sync().await;
        assert_eq!(report.outcome, SyncOutcome::ConnectivityLost);
        let op = h.queue.operations().await.remove(0);
        assert_eq!(op.status, OperationStatus::InFlight);
        assert_eq!(op.retry_count, 0);

        h.signal.set_online(true);
        h.remote.clear_calls();
        let report = h.coordinator.sync().await;

        assert_eq!(report.verified, 1);
        assert_eq!(report.pushed, 0);
        assert!(h.remote.write_calls().is_empty());
        assert_eq!(h.remote.count("patients"), 1);
        assert_eq!(h.queue.pending_count(), 0);
        assert!(!h.cache.record("patients", "p1").unwrap().dirty);
    }

    #[tokio::test]
    async fn test_conflict_last_write_wins_remote() {
        let h = harness();
        h.remote
            .insert("samples", "s1", doc(json!({"status": "new"})), 1_000);
        h.pull("samples", "s1").await;
        h.write("samples", "s1", OperationKind::Update, json!({"status": "collected"}))
            .await;

        let far_future = now_millis() + 3_600_000;
        h.remote
            .external_update("samples", "s1", &doc(json!({"status": "lost"})), Some(far_future))
            .unwrap();

        let report = h.coordinator.sync().await;
        assert_eq!(report.conflicts_resolved, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(h.cache.get("samples", "s1").unwrap()["status"], "lost");
        assert_eq!(h.remote.record("samples", "s1").unwrap().data["status"], "lost");
    }

    #[tokio::test]
    async fn test_conflict_last_write_wins_local() {
        let h = harness();
        h.remote
            .insert("samples", "s1", doc(json!({"status": "new", "site": "A"})), 1_000);
        h.pull("samples", "s1").await;
        h.remote
            .external_update("samples", "s1", &doc(json!({"site": "B"})), Some(2_000))
            .unwrap();
        h.write("samples", "s1", OperationKind::Update, json!({"status": "collected"}))
            .await;

        let report = h.coordinator.sync().await;
        assert_eq!(report.conflicts_resolved, 1);
        assert_eq!(report.pushed, 1);

        let cached = h.cache.get("samples", "s1").unwrap();
        assert_eq!(
            serde_json::Value::Object(cached),
            json!({"status": "collected", "site": "B"})
        );
    }

    #[tokio::test]
    async fn test_resolver_invoked_once_with_merged_output() {
        let h = harness();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = calls.clone();
        h.resolvers.set(
            "samples",
            Arc::new(FnResolver::new(move |conflict| {
                counter.fetch_add(1, Ordering::SeqCst);
                let mut merged = conflict.remote.data.clone();
                merged.insert("reviewed".into(), json!(true));
                Ok(ConflictResolution::Merged(merged))
            })),
        );

        h.remote
            .insert("samples", "s1", doc(json!({"status": "new"})), 1_000);
        h.pull("samples", "s1").await;
        h.remote
            .external_update("samples", "s1", &doc(json!({"status": "lost"})), Some(2_000))
            .unwrap();
        h.write("samples", "s1", OperationKind::Update, json!({"status": "collected"}))
            .await;

        h.coordinator.sync().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            serde_json::Value::Object(h.cache.get("samples", "s1").unwrap()),
            json!({"status": "lost", "reviewed": true})
        );
    }

    #[tokio::test]
    async fn test_manual_conflict_is_dead_lettered() {
        let h = harness();
        h.resolvers
            .set_default(ConflictResolutionStrategy::Manual.create_resolver());
        h.remote
            .insert("samples", "s1", doc(json!({"status": "new"})), 1_000);
        h.pull("samples", "s1").await;
        h.remote
            .external_update("samples", "s1", &doc(json!({"status": "lost"})), Some(2_000))
            .unwrap();
        h.write("samples", "s1", OperationKind::Update, json!({"status": "collected"}))
            .await;

        let report = h.coordinator.sync().await;
        assert_eq!(report.failed, 1);
        let failed = h.queue.failed_operations().await;
        assert_eq!(failed[0].error_kind, Some(crate::error::ErrorKind::Conflict));
        assert_eq!(h.cache.get("samples", "s1").unwrap()["status"], "new");
    }

    #[tokio::test]
    async fn test_panicking_resolver_is_dead_lettered() {
        let h = harness();
        h.resolvers.set(
            "samples",
            Arc::new(FnResolver::new(|_| panic!("resolver bug"))),
        );
        h.remote
            .insert("samples", "s1", doc(json!({"status": "new"})), 1_000);
        h.pull("samples", "s1").await;
        h.remote
            .external_update("samples", "s1", &doc(json!({"status": "lost"})), Some(2_000))
            .unwrap();
        h.write("samples", "s1", OperationKind::Update, json!({"status": "collected"}))
            .await;
        h.write("patients", "p1", OperationKind::Create, json!({"name": "Doe"}))
            .await;

        let report = h.coordinator.sync().await;
        assert_eq!(report.outcome, SyncOutcome::Completed);
        assert_eq!(report.failed, 1);
        assert_eq!(report.pushed, 1);
        assert!(!h.coordinator.is_running());

        let status = h.coordinator.status().await;
        assert!(!status.in_progress);
        assert_eq!(status.errors.len(), 1);
        let failed = h.queue.failed_operations().await;
        assert_eq!(failed[0].error_kind, Some(crate::error::ErrorKind::Conflict));
        assert_eq!(h.remote.record("samples", "s1").unwrap().data["status"], "lost");
    }

    #[tokio::test]
    async fn test_slow_remote_times_out_into_retry() {
        let h = harness_with_timeout(Duration::from_millis(20));
        h.write("patients", "p1", OperationKind::Create, json!({"name": "Doe"}))
            .await;
        h.remote.set_latency(Some(Duration::from_millis(500)));

        let report = h.coordinator.sync().await;
        assert!(matches!(report.outcome, SyncOutcome::RetryScheduled { .. }));
        assert_eq!(report.retried, 1);
        assert!(!h.coordinator.is_running());

        let op = h.queue.operations().await.remove(0);
        assert_eq!(op.status, OperationStatus::RetryScheduled);
        assert_eq!(op.retry_count, 1);
        assert_eq!(op.error_kind, Some(crate::error::ErrorKind::Network));
        assert_eq!(h.remote.count("patients"), 0);
    }

    #[tokio::test]
    async fn test_timeout_after_going_offline_leaves_operation_in_flight() {
        let h = harness_with_timeout(Duration::from_millis(100));
        h.write("patients", "p1", OperationKind::Create, json!({"name": "Doe"}))
            .await;
        h.remote.set_latency(Some(Duration::from_millis(1_000)));

        let signal = h.signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            signal.set_online(false);
        });

        let report = h.coordinator.sync().await;
        assert_eq!(report.outcome, SyncOutcome::ConnectivityLost);
        let op = h.queue.operations().await.remove(0);
        assert_eq!(op.status, OperationStatus::InFlight);
        assert_eq!(op.retry_count, 0);
    }

    #[tokio::test]
    async fn test_operation_cancelled_before_replay_is_skipped() {
        let h = harness();
        h.write("patients", "p1", OperationKind::Create, json!({"name": "Doe"}))
            .await;
        let op = h.queue.dequeue_next(now_millis()).await.unwrap();
        h.queue
            .enqueue("patients", "p1", OperationKind::Delete, Document::new(), None)
            .await
            .unwrap();

        let mut report = SyncReport::new(SyncOutcome::Completed);
        let step = h.coordinator.replay(op, &mut report).await;
        assert!(matches!(step, Step::Continue));
        assert!(report.errors.is_empty());
        assert!(h.remote.calls().is_empty());
        assert!(h.queue.operations().await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_of_missing_document_commits() {
        let h = harness();
        h.remote
            .insert("samples", "s1", doc(json!({"status": "new"})), 1_000);
        h.pull("samples", "s1").await;
        h.write("samples", "s1", OperationKind::Delete, json!({})).await;
        h.remote.external_delete("samples", "s1");

        let report = h.coordinator.sync().await;
        assert_eq!(report.skipped, 1);
        assert_eq!(h.queue.pending_count(), 0);
        assert!(h.cache.record("samples", "s1").is_none());
    }

    #[tokio::test]
    async fn test_update_of_missing_document_is_conflict() {
        let h = harness();
        h.write("samples", "ghost", OperationKind::Update, json!({"status": "x"}))
            .await;

        let report = h.coordinator.sync().await;
        assert_eq!(report.failed, 1);
        assert!(h.cache.get("samples", "ghost").is_none());
    }
}
