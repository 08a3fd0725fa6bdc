//! Sync status reporting
//!
//! Listeners run synchronously, in registration order, on every publish.
//! A failing or panicking listener is logged and skipped.

use crate::error::ErrorKind;
use crate::queue::QueuedOperation;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

/// An unresolved problem shown to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusError {
    pub kind: ErrorKind,
    pub message: String,
    /// Dead-lettered operation this error belongs to
    pub sequence: Option<u64>,
    pub collection: Option<String>,
    pub document_id: Option<String>,
}

impl StatusError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Storage,
            message: message.into(),
            sequence: None,
            collection: None,
            document_id: None,
        }
    }

    pub fn from_operation(op: &QueuedOperation) -> Self {
        Self {
            kind: op.error_kind.unwrap_or(ErrorKind::Other),
            message: op
                .last_error
                .clone()
                .unwrap_or_else(|| "operation failed".to_string()),
            sequence: Some(op.sequence),
            collection: Some(op.collection.clone()),
            document_id: Some(op.document_id.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub online: bool,
    /// Operations in `pending`, `retry_scheduled` or `in_flight`
    pub pending_count: usize,
    /// Unix millis of the last pass that drained the queue
    pub last_successful_sync: Option<i64>,
    pub errors: Vec<StatusError>,
    pub in_progress: bool,
}

impl SyncStatus {
    /// Nothing left to replay and no dead letters awaiting the user
    pub fn is_idle(&self) -> bool {
        self.pending_count == 0 && self.errors.is_empty() && !self.in_progress
    }
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            online: true,
            pending_count: 0,
            last_successful_sync: None,
            errors: Vec::new(),
            in_progress: false,
        }
    }
}

pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;
pub type StatusListener = dyn Fn(&SyncStatus) -> Result<(), ListenerError> + Send + Sync;

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

pub struct SyncStatusPublisher {
    next_token: AtomicU64,
    listeners: Mutex<Vec<(SubscriptionToken, Arc<StatusListener>)>>,
    latest: watch::Sender<SyncStatus>,
}

impl Default for SyncStatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStatusPublisher {
    pub fn new() -> Self {
        let (latest, _) = watch::channel(SyncStatus::default());
        Self {
            next_token: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
            latest,
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionToken
    where
        F: Fn(&SyncStatus) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::SeqCst));
        self.listeners.lock().push((token, Arc::new(listener)));
        token
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(t, _)| *t != token);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn publish(&self, status: SyncStatus) {
        self.latest.send_replace(status.clone());

        let snapshot: Vec<(SubscriptionToken, Arc<StatusListener>)> =
            self.listeners.lock().clone();
        for (token, listener) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(&status))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Status listener {:?} failed: {}", token, e),
                Err(_) => warn!("Status listener {:?} panicked", token),
            }
        }
    }

    /// Receiver that always holds the latest status.
    pub fn watch(&self) -> watch::Receiver<SyncStatus> {
        self.latest.subscribe()
    }

    pub fn current(&self) -> SyncStatus {
        self.latest.borrow().clone()
    }
}
