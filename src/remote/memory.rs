//! In-process remote store
//!
//! Behaves like the real backend (versions, merge-patch updates, idempotency
//! ledger) and records every call so tests can assert on what went over the
//! wire. Failures can be injected per call.

use super::{RemoteRecord, RemoteStore, WriteReceipt};
use crate::error::{SyncError, SyncResult};
use crate::network::ManualSignal;
use crate::queue::OperationKind;
use crate::types::{merge_fields, now_millis, Document};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteMethod {
    Create,
    Read,
    Update,
    Delete,
    Lookup,
}

impl RemoteMethod {
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            RemoteMethod::Create | RemoteMethod::Update | RemoteMethod::Delete
        )
    }
}

/// One recorded call
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCall {
    pub method: RemoteMethod,
    pub collection: String,
    pub document_id: String,
    pub payload: Option<Document>,
    pub idempotency_key: Option<String>,
}

enum Injected {
    /// Reject the write without applying it
    Fail(SyncError),
    /// Apply the write, then drop the connection before the answer arrives
    LoseConnection(Option<Arc<ManualSignal>>),
}

#[derive(Default)]
struct Inner {
    records: BTreeMap<(String, String), RemoteRecord>,
    ledger: HashMap<String, WriteReceipt>,
    calls: Vec<RemoteCall>,
    next_version: u64,
    injected: VecDeque<Injected>,
    unreachable: bool,
    latency: Option<Duration>,
}

impl Inner {
    fn next_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

#[derive(Default)]
pub struct InMemoryRemoteStore {
    inner: Mutex<Inner>,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document as if written by another client.
    pub fn insert(&self, collection: &str, id: &str, data: Document, modified_at: i64) -> RemoteRecord {
        let mut inner = self.inner.lock();
        let record = RemoteRecord {
            data,
            version: inner.next_version(),
            modified_at: Some(modified_at),
        };
        inner
            .records
            .insert((collection.to_string(), id.to_string()), record.clone());
        record
    }

    /// Concurrent change made by another client.
    pub fn external_update(
        &self,
        collection: &str,
        id: &str,
        patch: &Document,
        modified_at: Option<i64>,
    ) -> SyncResult<RemoteRecord> {
        let mut inner = self.inner.lock();
        let version = inner.next_version();
        let record = inner
            .records
            .get_mut(&(collection.to_string(), id.to_string()))
            .ok_or_else(|| SyncError::NotFound(format!("{}/{}", collection, id)))?;
        merge_fields(&mut record.data, patch);
        record.version = version;
        record.modified_at = modified_at;
        Ok(record.clone())
    }

    pub fn external_delete(&self, collection: &str, id: &str) -> bool {
        self.inner
            .lock()
            .records
            .remove(&(collection.to_string(), id.to_string()))
            .is_some()
    }

    pub fn record(&self, collection: &str, id: &str) -> Option<RemoteRecord> {
        self.inner
            .lock()
            .records
            .get(&(collection.to_string(), id.to_string()))
            .cloned()
    }

    pub fn count(&self, collection: &str) -> usize {
        self.inner
            .lock()
            .records
            .keys()
            .filter(|(c, _)| c == collection)
            .count()
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.inner.lock().calls.clone()
    }

    /// Recorded create/update/delete calls only
    pub fn write_calls(&self) -> Vec<RemoteCall> {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|c| c.method.is_write())
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().calls.clear();
    }

    /// Reject the next write with `err`.
    pub fn fail_next_write(&self, err: SyncError) {
        self.inner.lock().injected.push_back(Injected::Fail(err));
    }

    /// Apply the next write but answer with a network error, flipping
    /// `signal` offline first when given.
    pub fn lose_connection_after_next_write(&self, signal: Option<Arc<ManualSignal>>) {
        self.inner
            .lock()
            .injected
            .push_back(Injected::LoseConnection(signal));
    }

    /// Every call fails with a network error while set.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.lock().unreachable = unreachable;
    }

    /// Delay every call by `latency` before it reaches the store.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.inner.lock().latency = latency;
    }

    async fn delay(&self) {
        let latency = self.inner.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn begin(
        &self,
        method: RemoteMethod,
        collection: &str,
        id: &str,
        payload: Option<&Document>,
        idempotency_key: Option<&str>,
    ) -> SyncResult<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(RemoteCall {
            method,
            collection: collection.to_string(),
            document_id: id.to_string(),
            payload: payload.cloned(),
            idempotency_key: idempotency_key.map(str::to_string),
        });
        if inner.unreachable {
            return Err(SyncError::Network("remote unreachable".into()));
        }
        Ok(())
    }

    /// Run a write through injection, the idempotency ledger and `apply`.
    fn write<F>(
        &self,
        kind: OperationKind,
        collection: &str,
        id: &str,
        idempotency_key: &str,
        apply: F,
    ) -> SyncResult<Option<RemoteRecord>>
    where
        F: FnOnce(&mut Inner) -> SyncResult<Option<RemoteRecord>>,
    {
        let (result, lost) = {
            let mut inner = self.inner.lock();

            let mut lost = None;
            match inner.injected.pop_front() {
                Some(Injected::Fail(err)) => return Err(err),
                Some(Injected::LoseConnection(signal)) => lost = Some(signal),
                None => {}
            }

            if let Some(receipt) = inner.ledger.get(idempotency_key) {
                debug!("Replayed write {} answered from ledger", idempotency_key);
                return Ok(receipt.record.clone());
            }

            let record = apply(&mut inner)?;
            inner.ledger.insert(
                idempotency_key.to_string(),
                WriteReceipt {
                    idempotency_key: idempotency_key.to_string(),
                    collection: collection.to_string(),
                    document_id: id.to_string(),
                    kind,
                    record: record.clone(),
                },
            );
            (record, lost)
        };

        match lost {
            Some(signal) => {
                if let Some(signal) = signal {
                    signal.set_online(false);
                }
                Err(SyncError::Network("connection reset".into()))
            }
            None => Ok(result),
        }
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn create(
        &self,
        collection: &str,
        id: &str,
        data: &Document,
        idempotency_key: &str,
    ) -> SyncResult<RemoteRecord> {
        self.begin(RemoteMethod::Create, collection, id, Some(data), Some(idempotency_key))?;
        self.delay().await;
        let key = (collection.to_string(), id.to_string());
        let record = self.write(OperationKind::Create, collection, id, idempotency_key, |inner| {
            if inner.records.contains_key(&key) {
                return Err(SyncError::Validation(format!(
                    "document {}/{} already exists",
                    collection, id
                )));
            }
            let record = RemoteRecord {
                data: data.clone(),
                version: inner.next_version(),
                modified_at: Some(now_millis()),
            };
            inner.records.insert(key, record.clone());
            Ok(Some(record))
        })?;
        record.ok_or_else(|| SyncError::NotFound(format!("{}/{}", collection, id)))
    }

    async fn read(&self, collection: &str, id: &str) -> SyncResult<Option<RemoteRecord>> {
        self.begin(RemoteMethod::Read, collection, id, None, None)?;
        self.delay().await;
        Ok(self.record(collection, id))
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: &Document,
        idempotency_key: &str,
    ) -> SyncResult<RemoteRecord> {
        self.begin(RemoteMethod::Update, collection, id, Some(patch), Some(idempotency_key))?;
        self.delay().await;
        let key = (collection.to_string(), id.to_string());
        let record = self.write(OperationKind::Update, collection, id, idempotency_key, |inner| {
            let version = inner.next_version();
            let record = inner
                .records
                .get_mut(&key)
                .ok_or_else(|| SyncError::NotFound(format!("{}/{}", collection, id)))?;
            merge_fields(&mut record.data, patch);
            record.version = version;
            record.modified_at = Some(now_millis());
            Ok(Some(record.clone()))
        })?;
        record.ok_or_else(|| SyncError::NotFound(format!("{}/{}", collection, id)))
    }

    async fn delete(&self, collection: &str, id: &str, idempotency_key: &str) -> SyncResult<()> {
        self.begin(RemoteMethod::Delete, collection, id, None, Some(idempotency_key))?;
        self.delay().await;
        let key = (collection.to_string(), id.to_string());
        self.write(OperationKind::Delete, collection, id, idempotency_key, |inner| {
            inner.records.remove(&key);
            Ok(None)
        })?;
        Ok(())
    }

    async fn lookup(&self, idempotency_key: &str) -> SyncResult<Option<WriteReceipt>> {
        self.begin(RemoteMethod::Lookup, "", "", None, Some(idempotency_key))?;
        self.delay().await;
        Ok(self.inner.lock().ledger.get(idempotency_key).cloned())
    }
}
