//! Offline-first engine facade
//!
//! Writes go to the durable queue and the optimistic cache; reads come from
//! the cache. A background task replays the queue on a timer, on demand and
//! when connectivity comes back.

use super::conflict::{ConflictResolver, ConflictResolvers};
use super::coordinator::{SyncCoordinator, SyncOutcome, SyncReport};
use super::status::{ListenerError, SubscriptionToken, SyncStatus, SyncStatusPublisher};
use crate::cache::{CacheStore, CachedRecord, Filter, RemoteSnapshot};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::network::{ConnectivitySignal, ListenerToken, NetworkMonitor};
use crate::queue::{EnqueueOutcome, LocalOperationQueue, OperationKind, QueuedOperation};
use crate::remote::RemoteStore;
use crate::storage::DurableStorage;
use crate::types::{now_millis, Document};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Commands for the background sync task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncCommand {
    /// Trigger a sync now
    SyncNow,
    /// Connectivity transition reported by the monitor
    ConnectivityChanged(bool),
    /// Stop the background task
    Stop,
}

pub struct SyncEngineBuilder {
    storage: Arc<dyn DurableStorage>,
    remote: Arc<dyn RemoteStore>,
    config: SyncConfig,
    signal: Option<Arc<dyn ConnectivitySignal>>,
    resolvers: ConflictResolvers,
}

impl SyncEngineBuilder {
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn signal(mut self, signal: Arc<dyn ConnectivitySignal>) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn default_resolver(self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolvers.set_default(resolver);
        self
    }

    pub fn resolver(self, collection: &str, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolvers.set(collection, resolver);
        self
    }

    /// Restore queue and cache from storage and wire the components.
    pub async fn build(self) -> SyncResult<Arc<SyncEngine>> {
        self.config.validate()?;

        let queue = Arc::new(LocalOperationQueue::new(
            self.storage.clone(),
            self.config.queue.clone(),
            self.config.retry.clone(),
        ));
        let cache = Arc::new(CacheStore::new(self.storage.clone()));
        queue.load().await?;
        cache.load().await?;
        restore_overlays(&queue, &cache).await;

        let monitor = NetworkMonitor::new(self.signal);
        monitor.start();
        let resolvers = Arc::new(self.resolvers);
        let publisher = Arc::new(SyncStatusPublisher::new());
        let coordinator = Arc::new(SyncCoordinator::new(
            queue.clone(),
            cache.clone(),
            self.remote,
            monitor.clone(),
            resolvers.clone(),
            publisher.clone(),
            self.storage,
            self.config.request_timeout(),
        ));
        coordinator.load().await?;

        let engine = Arc::new(SyncEngine {
            config: self.config,
            queue,
            cache,
            monitor,
            resolvers,
            publisher,
            coordinator,
            command_tx: Mutex::new(None),
            worker: Mutex::new(None),
            monitor_token: Mutex::new(None),
        });
        engine.coordinator.publish_status().await;
        Ok(engine)
    }
}

/// Rebuild the optimistic overlay of every record from the active queue.
async fn restore_overlays(queue: &LocalOperationQueue, cache: &CacheStore) {
    let mut keys: BTreeSet<(String, String)> = queue
        .operations()
        .await
        .into_iter()
        .filter(|op| op.status.is_active())
        .map(|op| (op.collection, op.document_id))
        .collect();
    keys.extend(cache.dirty_keys());

    for (collection, id) in &keys {
        let pending = queue.pending_for(collection, id).await;
        if let Err(e) = cache
            .reconcile(collection, id, RemoteSnapshot::Unchanged, &pending)
            .await
        {
            warn!("Failed to restore local view of {}/{}: {}", collection, id, e);
        }
    }
    debug!("Restored local view of {} records", keys.len());
}

pub struct SyncEngine {
    config: SyncConfig,
    queue: Arc<LocalOperationQueue>,
    cache: Arc<CacheStore>,
    monitor: Arc<NetworkMonitor>,
    resolvers: Arc<ConflictResolvers>,
    publisher: Arc<SyncStatusPublisher>,
    coordinator: Arc<SyncCoordinator>,
    command_tx: Mutex<Option<mpsc::Sender<SyncCommand>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    monitor_token: Mutex<Option<ListenerToken>>,
}

impl SyncEngine {
    pub fn builder(storage: Arc<dyn DurableStorage>, remote: Arc<dyn RemoteStore>) -> SyncEngineBuilder {
        SyncEngineBuilder {
            storage,
            remote,
            config: SyncConfig::default(),
            signal: None,
            resolvers: ConflictResolvers::default(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn resolvers(&self) -> &ConflictResolvers {
        &self.resolvers
    }

    pub fn is_online(&self) -> bool {
        self.monitor.is_online()
    }

    // ==================== Lifecycle ====================

    /// Start the background sync task and forward connectivity changes to it.
    pub fn start(self: &Arc<Self>) {
        let mut command_tx = self.command_tx.lock();
        if command_tx.is_some() {
            return;
        }

        let (tx, rx) = mpsc::channel(100);
        *command_tx = Some(tx.clone());

        let forward = tx.clone();
        *self.monitor_token.lock() = Some(self.monitor.subscribe(Arc::new(move |online: bool| {
            if forward
                .try_send(SyncCommand::ConnectivityChanged(online))
                .is_err()
            {
                warn!("Sync command channel full, dropping connectivity change");
            }
        })));

        let worker = tokio::spawn(run_worker(
            self.coordinator.clone(),
            self.config.clone(),
            rx,
        ));
        *self.worker.lock() = Some(worker);
        info!("Sync engine started");
    }

    /// Stop the background task. Connectivity keeps being tracked until
    /// `shutdown`.
    pub async fn stop(&self) {
        let tx = self.command_tx.lock().take();
        let worker = self.worker.lock().take();

        if let Some(token) = self.monitor_token.lock().take() {
            self.monitor.unsubscribe(token);
        }

        if let Some(tx) = tx {
            let _ = tx.send(SyncCommand::Stop).await;
        }
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Sync task ended abnormally: {}", e);
            }
        }
        info!("Sync engine stopped");
    }

    /// Stop the background task and release the platform connectivity signal.
    pub async fn shutdown(&self) {
        self.stop().await;
        self.monitor.stop();
    }

    pub fn is_started(&self) -> bool {
        self.command_tx.lock().is_some()
    }

    // ==================== Writes ====================

    pub async fn create(&self, collection: &str, id: &str, data: Document) -> SyncResult<EnqueueOutcome> {
        if self.cache.get(collection, id).is_some() {
            return Err(SyncError::Validation(format!(
                "document {}/{} already exists",
                collection, id
            )));
        }
        self.write(collection, id, OperationKind::Create, data).await
    }

    pub async fn update(&self, collection: &str, id: &str, patch: Document) -> SyncResult<EnqueueOutcome> {
        self.write(collection, id, OperationKind::Update, patch).await
    }

    pub async fn delete(&self, collection: &str, id: &str) -> SyncResult<EnqueueOutcome> {
        self.write(collection, id, OperationKind::Delete, Document::new())
            .await
    }

    async fn write(
        &self,
        collection: &str,
        id: &str,
        kind: OperationKind,
        payload: Document,
    ) -> SyncResult<EnqueueOutcome> {
        validate_target(collection, id)?;

        let base = self.cache.version_of(collection, id);
        let outcome = self
            .queue
            .enqueue(collection, id, kind, payload.clone(), base)
            .await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                self.coordinator.publish_status().await;
                return Err(e);
            }
        };

        // The queue entry is durable; a cache flush failure only shows up in status.
        let cached = match &outcome {
            EnqueueOutcome::Cancelled { .. } | EnqueueOutcome::Coalesced(_) => {
                let remaining = self.queue.pending_for(collection, id).await;
                self.cache
                    .reconcile(collection, id, RemoteSnapshot::Unchanged, &remaining)
                    .await
            }
            _ => self.cache.apply_local(collection, id, kind, &payload).await,
        };
        if let Err(e) = cached {
            warn!("Cache update for {}/{} failed: {}", collection, id, e);
        }

        self.coordinator.publish_status().await;
        if self.config.sync_on_write && self.monitor.is_online() {
            self.request_sync();
        }
        Ok(outcome)
    }

    // ==================== Reads ====================

    pub fn get(&self, collection: &str, id: &str) -> Option<Document> {
        self.cache.get(collection, id)
    }

    pub fn list(&self, collection: &str, filter: &Filter) -> Vec<(String, Document)> {
        self.cache.list(collection, filter)
    }

    pub fn record(&self, collection: &str, id: &str) -> Option<CachedRecord> {
        self.cache.record(collection, id)
    }

    /// Refresh one document from the remote store.
    pub async fn refresh(&self, collection: &str, id: &str) -> SyncResult<Option<Document>> {
        validate_target(collection, id)?;
        self.coordinator.pull(collection, id).await
    }

    /// Store a snapshot obtained outside of sync, e.g. from a bulk export.
    /// Queued local mutations stay layered over it.
    pub async fn prime(&self, collection: &str, id: &str, data: Document) -> SyncResult<()> {
        validate_target(collection, id)?;
        self.cache.put(collection, id, data).await
    }

    /// Forget a synced record. Fails with `Validation` while it is dirty.
    pub async fn evict(&self, collection: &str, id: &str) -> SyncResult<()> {
        validate_target(collection, id)?;
        self.cache.evict(collection, id).await
    }

    // ==================== Status & control ====================

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionToken
    where
        F: Fn(&SyncStatus) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.publisher.subscribe(listener)
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.publisher.unsubscribe(token)
    }

    pub fn watch(&self) -> watch::Receiver<SyncStatus> {
        self.publisher.watch()
    }

    /// Run a pass now and wait for it.
    pub async fn trigger_sync(&self) -> SyncReport {
        self.coordinator.sync().await
    }

    /// Ask the background task for a pass without waiting.
    pub fn request_sync(&self) {
        if let Some(tx) = self.command_tx.lock().as_ref() {
            if tx.try_send(SyncCommand::SyncNow).is_err() {
                debug!("Sync already requested");
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.queue.pending_count()
    }

    pub async fn status(&self) -> SyncStatus {
        self.coordinator.status().await
    }

    pub async fn operations(&self) -> Vec<QueuedOperation> {
        self.queue.operations().await
    }

    // ==================== Dead letters ====================

    pub async fn failed_operations(&self) -> Vec<QueuedOperation> {
        self.queue.failed_operations().await
    }

    /// Put a dead-lettered operation back in line and restore it in the
    /// optimistic view.
    pub async fn retry_failed(&self, sequence: u64) -> SyncResult<QueuedOperation> {
        let op = self.queue.retry_failed(sequence).await?;
        let remaining = self
            .queue
            .pending_for(&op.collection, &op.document_id)
            .await;
        self.cache
            .reconcile(&op.collection, &op.document_id, RemoteSnapshot::Unchanged, &remaining)
            .await?;
        self.coordinator.publish_status().await;
        info!("Operation #{} re-queued by operator", sequence);
        Ok(op)
    }

    pub async fn discard_failed(&self, sequence: u64) -> SyncResult<QueuedOperation> {
        let op = self.queue.discard(sequence).await?;
        self.coordinator.publish_status().await;
        info!("Operation #{} discarded by operator", sequence);
        Ok(op)
    }
}

fn validate_target(collection: &str, id: &str) -> SyncResult<()> {
    if collection.is_empty() || collection.contains('/') {
        return Err(SyncError::Validation(format!(
            "invalid collection name '{}'",
            collection
        )));
    }
    if id.is_empty() {
        return Err(SyncError::Validation("document id must not be empty".into()));
    }
    Ok(())
}

/// Time left until a scheduled retry, if one is pending.
fn retry_delay(until: Option<i64>) -> Option<Duration> {
    until.map(|at| Duration::from_millis(at.saturating_sub(now_millis()).max(0) as u64))
}

async fn run_worker(
    coordinator: Arc<SyncCoordinator>,
    config: SyncConfig,
    mut rx: mpsc::Receiver<SyncCommand>,
) {
    let mut sync_interval = interval(config.sync_interval());
    sync_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut retry_at: Option<i64> = None;

    let run = |coordinator: Arc<SyncCoordinator>| async move {
        let report = coordinator.sync().await;
        match report.outcome {
            SyncOutcome::RetryScheduled { until } => Some(Some(until)),
            SyncOutcome::AlreadyRunning => None,
            _ => Some(None),
        }
    };

    loop {
        let retry = retry_delay(retry_at);
        tokio::select! {
            // Periodic sync
            _ = sync_interval.tick(), if config.auto_sync => {
                debug!("Starting periodic sync");
                if let Some(next) = run(coordinator.clone()).await {
                    retry_at = next;
                }
            }

            // Queue head became due
            _ = tokio::time::sleep(retry.unwrap_or(Duration::from_secs(3600))), if retry.is_some() => {
                debug!("Retry due, starting sync");
                if let Some(next) = run(coordinator.clone()).await {
                    retry_at = next;
                }
            }

            // Handle commands
            cmd = rx.recv() => {
                match cmd {
                    Some(SyncCommand::SyncNow) => {
                        info!("Manual sync triggered");
                        if let Some(next) = run(coordinator.clone()).await {
                            retry_at = next;
                        }
                    }
                    Some(SyncCommand::ConnectivityChanged(true)) => {
                        info!("Going online - replaying queue");
                        if let Some(next) = run(coordinator.clone()).await {
                            retry_at = next;
                        }
                    }
                    Some(SyncCommand::ConnectivityChanged(false)) => {
                        warn!("Going offline - queueing changes");
                        coordinator.publish_status().await;
                    }
                    Some(SyncCommand::Stop) | None => {
                        info!("Sync task stopping");
                        break;
                    }
                }
            }
        }
    }
}
