//! Conflict Resolution Strategies for Offline Sync
//!
//! A conflict exists when the remote document's version differs from the
//! base version captured when the local mutation was queued. A resolver
//! decides which side wins, or produces a merged document.

use crate::error::{SyncError, SyncResult};
use crate::queue::{OperationKind, QueuedOperation};
use crate::remote::RemoteRecord;
use crate::types::{merge_fields, Document};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// A queued mutation whose base diverged from the remote document
#[derive(Debug, Clone)]
pub struct Conflict {
    pub collection: String,
    pub document_id: String,
    pub kind: OperationKind,
    /// Local payload; empty for deletes
    pub local: Document,
    /// When the local write happened, unix millis
    pub local_timestamp: i64,
    pub base_version: Option<String>,
    pub remote: RemoteRecord,
}

impl Conflict {
    pub fn new(op: &QueuedOperation, remote: RemoteRecord) -> Self {
        Self {
            collection: op.collection.clone(),
            document_id: op.document_id.clone(),
            kind: op.kind,
            local: op.payload.clone(),
            local_timestamp: op.local_timestamp,
            base_version: op.base_version.clone(),
            remote,
        }
    }
}

/// Trait for conflict resolution strategies
#[async_trait::async_trait]
pub trait ConflictResolver: Send + Sync {
    /// Decide the outcome, or fail with `SyncError::Conflict` when the
    /// conflict cannot be decided automatically.
    async fn resolve(&self, conflict: &Conflict) -> SyncResult<ConflictResolution>;

    /// Get the name of this resolver
    fn name(&self) -> &'static str;
}

/// Result of conflict resolution
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictResolution {
    /// Apply the local mutation over the remote document
    LocalWins,
    /// Drop the local mutation and keep the remote document
    RemoteWins,
    /// Write this document instead of the local payload
    Merged(Document),
}

/// Predefined conflict resolution strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolutionStrategy {
    /// Compare local write time with the remote modification time (default)
    LastWriteWins,
    /// Remote document with the local fields laid over it
    FieldMerge,
    /// Every conflict is surfaced to the user
    Manual,
}

impl ConflictResolutionStrategy {
    /// Create a resolver for this strategy
    pub fn create_resolver(&self) -> Arc<dyn ConflictResolver> {
        match self {
            ConflictResolutionStrategy::LastWriteWins => Arc::new(LastWriteWinsResolver),
            ConflictResolutionStrategy::FieldMerge => Arc::new(FieldMergeResolver),
            ConflictResolutionStrategy::Manual => Arc::new(ManualResolver),
        }
    }
}

impl std::str::FromStr for ConflictResolutionStrategy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "last_write_wins" | "lww" => Ok(ConflictResolutionStrategy::LastWriteWins),
            "field_merge" => Ok(ConflictResolutionStrategy::FieldMerge),
            "manual" => Ok(ConflictResolutionStrategy::Manual),
            other => Err(SyncError::Config(format!(
                "unknown conflict strategy '{}'",
                other
            ))),
        }
    }
}

/// Last-write-wins on wall-clock timestamps. Ties go to the local write.
pub struct LastWriteWinsResolver;

#[async_trait::async_trait]
impl ConflictResolver for LastWriteWinsResolver {
    async fn resolve(&self, conflict: &Conflict) -> SyncResult<ConflictResolution> {
        let remote_ts = conflict.remote.modified_at.ok_or_else(|| {
            SyncError::Conflict(format!(
                "{}/{}: remote document has no modification time",
                conflict.collection, conflict.document_id
            ))
        })?;

        if conflict.local_timestamp >= remote_ts {
            Ok(ConflictResolution::LocalWins)
        } else {
            Ok(ConflictResolution::RemoteWins)
        }
    }

    fn name(&self) -> &'static str {
        "last_write_wins"
    }
}

/// Keeps remote fields the local write did not touch.
pub struct FieldMergeResolver;

#[async_trait::async_trait]
impl ConflictResolver for FieldMergeResolver {
    async fn resolve(&self, conflict: &Conflict) -> SyncResult<ConflictResolution> {
        match conflict.kind {
            OperationKind::Delete => LastWriteWinsResolver.resolve(conflict).await,
            OperationKind::Create | OperationKind::Update => {
                let mut merged = conflict.remote.data.clone();
                merge_fields(&mut merged, &conflict.local);
                Ok(ConflictResolution::Merged(merged))
            }
        }
    }

    fn name(&self) -> &'static str {
        "field_merge"
    }
}

/// Never decides; the operation is dead-lettered for the user.
pub struct ManualResolver;

#[async_trait::async_trait]
impl ConflictResolver for ManualResolver {
    async fn resolve(&self, conflict: &Conflict) -> SyncResult<ConflictResolution> {
        Err(SyncError::Conflict(format!(
            "{}/{} changed remotely (base {:?}, remote {})",
            conflict.collection,
            conflict.document_id,
            conflict.base_version,
            conflict.remote.version
        )))
    }

    fn name(&self) -> &'static str {
        "manual"
    }
}

type ResolveFn = dyn Fn(&Conflict) -> SyncResult<ConflictResolution> + Send + Sync;

/// Resolver backed by a caller closure
pub struct FnResolver {
    resolve: Box<ResolveFn>,
}

impl FnResolver {
    pub fn new<F>(resolve: F) -> Self
    where
        F: Fn(&Conflict) -> SyncResult<ConflictResolution> + Send + Sync + 'static,
    {
        Self {
            resolve: Box::new(resolve),
        }
    }
}

#[async_trait::async_trait]
impl ConflictResolver for FnResolver {
    async fn resolve(&self, conflict: &Conflict) -> SyncResult<ConflictResolution> {
        (self.resolve)(conflict)
    }

    fn name(&self) -> &'static str {
        "custom"
    }
}

/// Default resolver plus per-collection overrides
pub struct ConflictResolvers {
    default: RwLock<Arc<dyn ConflictResolver>>,
    overrides: RwLock<HashMap<String, Arc<dyn ConflictResolver>>>,
}

impl Default for ConflictResolvers {
    fn default() -> Self {
        Self::new(ConflictResolutionStrategy::LastWriteWins.create_resolver())
    }
}

impl ConflictResolvers {
    pub fn new(default: Arc<dyn ConflictResolver>) -> Self {
        Self {
            default: RwLock::new(default),
            overrides: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_default(&self, resolver: Arc<dyn ConflictResolver>) {
        *self.default.write() = resolver;
    }

    pub fn set(&self, collection: &str, resolver: Arc<dyn ConflictResolver>) {
        self.overrides
            .write()
            .insert(collection.to_string(), resolver);
    }

    pub fn remove(&self, collection: &str) {
        self.overrides.write().remove(collection);
    }

    pub fn for_collection(&self, collection: &str) -> Arc<dyn ConflictResolver> {
        if let Some(resolver) = self.overrides.read().get(collection) {
            return resolver.clone();
        }
        self.default.read().clone()
    }
}
