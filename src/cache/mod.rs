//! Record cache
//!
//! Last-known remote snapshots plus the uncommitted local state of each
//! record. Reads are served from memory and always return the optimistic
//! view (snapshot with queued local mutations applied). Mutations update
//! memory first and then write the whole record under `cache:`.

use crate::error::{SyncError, SyncResult};
use crate::queue::{OperationKind, QueuedOperation};
use crate::remote::RemoteRecord;
use crate::storage::DurableStorage;
use crate::types::{merge_fields, now_millis, Document, RecordVersion};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

const CACHE_PREFIX: &str = "cache:";

fn record_key(collection: &str, id: &str) -> String {
    format!("{}{}/{}", CACHE_PREFIX, collection, id)
}

/// A queued mutation layered over the remote snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalMutation {
    pub kind: OperationKind,
    #[serde(default)]
    pub payload: Document,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRecord {
    pub collection: String,
    pub id: String,
    /// Last-known remote snapshot
    pub data: Option<Document>,
    pub version: Option<String>,
    pub remote_modified_at: Option<i64>,
    /// Uncommitted mutations in queue order, replayed over `data` on read
    #[serde(default)]
    pub local: Vec<LocalMutation>,
    pub last_synced_at: Option<i64>,
    /// A queued mutation for this record has not committed yet
    pub dirty: bool,
}

impl CachedRecord {
    fn empty(collection: &str, id: &str) -> Self {
        Self {
            collection: collection.to_string(),
            id: id.to_string(),
            data: None,
            version: None,
            remote_modified_at: None,
            local: Vec::new(),
            last_synced_at: None,
            dirty: false,
        }
    }

    /// Snapshot with the uncommitted local mutations applied.
    pub fn view(&self) -> Option<Document> {
        self.local
            .iter()
            .fold(self.data.clone(), |current, mutation| match mutation.kind {
                OperationKind::Create => Some(mutation.payload.clone()),
                OperationKind::Update => {
                    let mut merged = current.unwrap_or_default();
                    merge_fields(&mut merged, &mutation.payload);
                    Some(merged)
                }
                OperationKind::Delete => None,
            })
    }

    pub fn record_version(&self) -> Option<RecordVersion> {
        self.version.as_ref().map(|version| RecordVersion {
            version: version.clone(),
            modified_at: self.remote_modified_at,
        })
    }

    fn apply(&mut self, kind: OperationKind, payload: &Document) {
        self.local.push(LocalMutation {
            kind,
            payload: payload.clone(),
        });
        self.dirty = true;
    }

    fn is_vacant(&self) -> bool {
        self.data.is_none() && self.local.is_empty()
    }
}

/// Authoritative remote outcome handed to `reconcile`
#[derive(Debug, Clone)]
pub enum RemoteSnapshot {
    /// The remote copy is unknown or unchanged
    Unchanged,
    Present(RemoteRecord),
    /// The remote copy no longer exists
    Absent,
}

/// Field-equality filter for `CacheStore::list`
#[derive(Debug, Clone, Default)]
pub struct Filter {
    equals: Vec<(String, Value)>,
    dirty_only: bool,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.push((field.into(), value.into()));
        self
    }

    /// Only records with uncommitted local mutations
    pub fn dirty_only(mut self) -> Self {
        self.dirty_only = true;
        self
    }

    fn matches(&self, record: &CachedRecord, view: &Document) -> bool {
        if self.dirty_only && !record.dirty {
            return false;
        }
        self.equals
            .iter()
            .all(|(field, expected)| view.get(field) == Some(expected))
    }
}

pub struct CacheStore {
    storage: Arc<dyn DurableStorage>,
    records: RwLock<BTreeMap<(String, String), CachedRecord>>,
    flush_lock: Mutex<()>,
    fault: parking_lot::Mutex<Option<String>>,
}

impl CacheStore {
    pub fn new(storage: Arc<dyn DurableStorage>) -> Self {
        Self {
            storage,
            records: RwLock::new(BTreeMap::new()),
            flush_lock: Mutex::new(()),
            fault: parking_lot::Mutex::new(None),
        }
    }

    /// Restore cached records from durable storage.
    pub async fn load(&self) -> SyncResult<usize> {
        let _guard = self.flush_lock.lock().await;
        let entries = self.storage.list(CACHE_PREFIX).await?;

        let mut records = self.records.write();
        records.clear();
        for (key, raw) in entries {
            match serde_json::from_slice::<CachedRecord>(&raw) {
                Ok(record) => {
                    records.insert((record.collection.clone(), record.id.clone()), record);
                }
                Err(e) => error!("Skipping corrupted cache entry {}: {}", key, e),
            }
        }
        info!("Loaded {} cached records", records.len());
        Ok(records.len())
    }

    /// Optimistic view of a record
    pub fn get(&self, collection: &str, id: &str) -> Option<Document> {
        self.records
            .read()
            .get(&(collection.to_string(), id.to_string()))
            .and_then(|r| r.view())
    }

    /// Full cache entry including sync metadata
    pub fn record(&self, collection: &str, id: &str) -> Option<CachedRecord> {
        self.records
            .read()
            .get(&(collection.to_string(), id.to_string()))
            .cloned()
    }

    /// Visible records of a collection matching `filter`, ordered by id.
    pub fn list(&self, collection: &str, filter: &Filter) -> Vec<(String, Document)> {
        self.records
            .read()
            .values()
            .filter(|r| r.collection == collection)
            .filter_map(|r| {
                let view = r.view()?;
                filter.matches(r, &view).then(|| (r.id.clone(), view))
            })
            .collect()
    }

    /// Records still carrying uncommitted local mutations
    pub fn dirty_keys(&self) -> Vec<(String, String)> {
        self.records
            .read()
            .iter()
            .filter(|(_, r)| r.dirty)
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn version_of(&self, collection: &str, id: &str) -> Option<RecordVersion> {
        self.records
            .read()
            .get(&(collection.to_string(), id.to_string()))
            .and_then(|r| r.record_version())
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Store a last-known snapshot fetched outside of replay.
    pub async fn put(&self, collection: &str, id: &str, data: Document) -> SyncResult<()> {
        self.mutate(collection, id, |record| {
            record.data = Some(data);
            record.last_synced_at = Some(now_millis());
        })
        .await
    }

    /// Drop a clean record. Records with queued mutations are kept.
    pub async fn evict(&self, collection: &str, id: &str) -> SyncResult<()> {
        let _guard = self.flush_lock.lock().await;
        {
            let mut records = self.records.write();
            let key = (collection.to_string(), id.to_string());
            if records.get(&key).is_some_and(|r| r.dirty) {
                return Err(SyncError::Validation(format!(
                    "{}/{} has unsynced local changes",
                    collection, id
                )));
            }
            records.remove(&key);
        }
        let result = self.storage.delete(&record_key(collection, id)).await;
        self.settle(result)
    }

    /// Layer a queued local mutation over the record.
    pub async fn apply_local(
        &self,
        collection: &str,
        id: &str,
        kind: OperationKind,
        payload: &Document,
    ) -> SyncResult<()> {
        self.mutate(collection, id, |record| record.apply(kind, payload))
            .await
    }

    /// Install the authoritative remote state and re-apply the mutations
    /// that are still queued for the record.
    pub async fn reconcile(
        &self,
        collection: &str,
        id: &str,
        remote: RemoteSnapshot,
        pending: &[QueuedOperation],
    ) -> SyncResult<()> {
        self.mutate(collection, id, |record| {
            match remote {
                RemoteSnapshot::Unchanged => {}
                RemoteSnapshot::Present(remote) => {
                    record.data = Some(remote.data);
                    record.version = Some(remote.version);
                    record.remote_modified_at = remote.modified_at;
                    record.last_synced_at = Some(now_millis());
                }
                RemoteSnapshot::Absent => {
                    record.data = None;
                    record.version = None;
                    record.remote_modified_at = None;
                    record.last_synced_at = Some(now_millis());
                }
            }

            record.local.clear();
            record.dirty = false;
            for op in pending {
                record.apply(op.kind, &op.payload);
            }
        })
        .await
    }

    /// The last failed write, until a later write succeeds.
    pub fn fault(&self) -> Option<String> {
        self.fault.lock().clone()
    }

    async fn mutate<F>(&self, collection: &str, id: &str, apply: F) -> SyncResult<()>
    where
        F: FnOnce(&mut CachedRecord),
    {
        let _guard = self.flush_lock.lock().await;
        let key = (collection.to_string(), id.to_string());

        let snapshot = {
            let mut records = self.records.write();
            let record = records
                .entry(key.clone())
                .or_insert_with(|| CachedRecord::empty(collection, id));
            apply(record);
            if record.is_vacant() {
                records.remove(&key);
                None
            } else {
                Some(record.clone())
            }
        };

        let storage_key = record_key(collection, id);
        let result = match snapshot {
            Some(record) => match serde_json::to_vec(&record) {
                Ok(raw) => self.storage.set(&storage_key, raw).await,
                Err(e) => Err(e.into()),
            },
            None => {
                debug!("Dropping vacant cache record {}/{}", collection, id);
                self.storage.delete(&storage_key).await
            }
        };
        self.settle(result)
    }

    fn settle(&self, result: SyncResult<()>) -> SyncResult<()> {
        match result {
            Ok(()) => {
                *self.fault.lock() = None;
                Ok(())
            }
            Err(e) => {
                let err = match e {
                    SyncError::Storage(_) => e,
                    other => SyncError::Storage(other.to_string()),
                };
                error!("Cache flush failed: {}", err);
                *self.fault.lock() = Some(err.to_string());
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{QueueConfig, RetryPolicy};
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        crate::types::into_document(value).unwrap()
    }

    fn remote(data: Value, version: &str) -> RemoteRecord {
        RemoteRecord {
            data: doc(data),
            version: version.to_string(),
            modified_at: Some(100),
        }
    }

    #[tokio::test]
    async fn test_optimistic_view_over_snapshot() {
        let cache = CacheStore::new(Arc::new(MemoryStorage::new()));
        cache
            .reconcile(
                "samples",
                "s1",
                RemoteSnapshot::Present(remote(json!({"status": "new", "site": "A"}), "1")),
                &[],
            )
            .await
            .unwrap();

        cache
            .apply_local("samples", "s1", OperationKind::Update, &doc(json!({"status": "collected"})))
            .await
            .unwrap();

        let view = cache.get("samples", "s1").unwrap();
        assert_eq!(Value::Object(view), json!({"status": "collected", "site": "A"}));

        let record = cache.record("samples", "s1").unwrap();
        assert!(record.dirty);
        assert_eq!(record.data.unwrap()["status"], "new");
        assert_eq!(cache.version_of("samples", "s1").unwrap().version, "1");
    }

    #[tokio::test]
    async fn test_local_delete_hides_record() {
        let cache = CacheStore::new(Arc::new(MemoryStorage::new()));
        cache
            .put("patients", "p1", doc(json!({"name": "Doe"})))
            .await
            .unwrap();
        cache
            .apply_local("patients", "p1", OperationKind::Delete, &Document::new())
            .await
            .unwrap();

        assert!(cache.get("patients", "p1").is_none());
        assert!(cache.list("patients", &Filter::new()).is_empty());
        assert!(cache.record("patients", "p1").is_some());
    }

    #[tokio::test]
    async fn test_reconcile_reapplies_remaining_mutations() {
        let storage = Arc::new(MemoryStorage::new());
        let cache = CacheStore::new(storage.clone());
        let queue = crate::queue::LocalOperationQueue::new(
            storage,
            QueueConfig::default(),
            RetryPolicy::default(),
        );
        queue
            .enqueue("samples", "s1", OperationKind::Update, doc(json!({"notes": "ok"})), None)
            .await
            .unwrap();
        let remaining = queue.pending_for("samples", "s1").await;

        cache
            .reconcile(
                "samples",
                "s1",
                RemoteSnapshot::Present(remote(json!({"status": "collected"}), "2")),
                &remaining,
            )
            .await
            .unwrap();

        let view = cache.get("samples", "s1").unwrap();
        assert_eq!(Value::Object(view), json!({"status": "collected", "notes": "ok"}));
        assert!(cache.record("samples", "s1").unwrap().dirty);

        cache
            .reconcile("samples", "s1", RemoteSnapshot::Unchanged, &[])
            .await
            .unwrap();
        let record = cache.record("samples", "s1").unwrap();
        assert!(!record.dirty);
        assert_eq!(Value::Object(record.view().unwrap()), json!({"status": "collected"}));
    }

    #[tokio::test]
    async fn test_reconcile_absent_drops_record() {
        let storage = Arc::new(MemoryStorage::new());
        let cache = CacheStore::new(storage.clone());
        cache
            .reconcile(
                "samples",
                "s1",
                RemoteSnapshot::Present(remote(json!({"a": 1}), "1")),
                &[],
            )
            .await
            .unwrap();
        cache
            .reconcile("samples", "s1", RemoteSnapshot::Absent, &[])
            .await
            .unwrap();

        assert!(cache.record("samples", "s1").is_none());
        assert!(storage.keys().is_empty());
    }

    #[tokio::test]
    async fn test_list_with_filter() {
        let cache = CacheStore::new(Arc::new(MemoryStorage::new()));
        cache
            .put("samples", "s1", doc(json!({"status": "collected"})))
            .await
            .unwrap();
        cache
            .put("samples", "s2", doc(json!({"status": "pending"})))
            .await
            .unwrap();
        cache
            .apply_local("samples", "s3", OperationKind::Create, &doc(json!({"status": "collected"})))
            .await
            .unwrap();

        let collected = cache.list("samples", &Filter::new().eq("status", "collected"));
        let ids: Vec<_> = collected.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s3"]);

        let dirty = cache.list("samples", &Filter::new().dirty_only());
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].0, "s3");
    }

    #[tokio::test]
    async fn test_reload_from_storage() {
        let storage = Arc::new(MemoryStorage::new());
        {
            let cache = CacheStore::new(storage.clone());
            cache
                .put("patients", "p1", doc(json!({"name": "Doe"})))
                .await
                .unwrap();
            cache
                .apply_local("patients", "p1", OperationKind::Update, &doc(json!({"age": 41})))
                .await
                .unwrap();
        }

        let cache = CacheStore::new(storage);
        assert_eq!(cache.load().await.unwrap(), 1);
        let view = cache.get("patients", "p1").unwrap();
        assert_eq!(Value::Object(view), json!({"name": "Doe", "age": 41}));
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_memory_and_previous_durable_copy() {
        let storage = Arc::new(MemoryStorage::new());
        let cache = CacheStore::new(storage.clone());
        cache
            .put("patients", "p1", doc(json!({"name": "Doe"})))
            .await
            .unwrap();

        storage.set_failing(true);
        let err = cache
            .put("patients", "p1", doc(json!({"name": "Roe"})))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Storage(_)));
        assert!(cache.fault().is_some());
        assert_eq!(cache.get("patients", "p1").unwrap()["name"], "Roe");

        storage.set_failing(false);
        let reloaded = CacheStore::new(storage);
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.get("patients", "p1").unwrap()["name"], "Doe");
    }

    #[tokio::test]
    async fn test_evict() {
        let storage = Arc::new(MemoryStorage::new());
        let cache = CacheStore::new(storage.clone());
        cache
            .put("patients", "p1", doc(json!({"name": "Doe"})))
            .await
            .unwrap();
        cache.evict("patients", "p1").await.unwrap();

        assert!(cache.get("patients", "p1").is_none());
        assert!(storage.keys().is_empty());
    }

    #[tokio::test]
    async fn test_put_under_pending_update_keeps_both() {
        let cache = CacheStore::new(Arc::new(MemoryStorage::new()));
        cache
            .put("samples", "s1", doc(json!({"status": "new", "site": "A"})))
            .await
            .unwrap();
        cache
            .apply_local("samples", "s1", OperationKind::Update, &doc(json!({"status": "collected"})))
            .await
            .unwrap();

        cache
            .put("samples", "s1", doc(json!({"status": "new", "site": "B"})))
            .await
            .unwrap();

        let view = cache.get("samples", "s1").unwrap();
        assert_eq!(Value::Object(view), json!({"status": "collected", "site": "B"}));
        assert!(cache.record("samples", "s1").unwrap().dirty);
    }

    #[tokio::test]
    async fn test_evict_refuses_dirty_record() {
        let storage = Arc::new(MemoryStorage::new());
        let cache = CacheStore::new(storage.clone());
        cache
            .apply_local("patients", "p1", OperationKind::Create, &doc(json!({"name": "Doe"})))
            .await
            .unwrap();

        let err = cache.evict("patients", "p1").await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        assert_eq!(cache.get("patients", "p1").unwrap()["name"], "Doe");
        assert_eq!(storage.keys().len(), 1);
    }
}
