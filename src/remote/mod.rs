//! Remote store abstraction
//!
//! Writes carry the idempotency key of the queued operation. The store keeps
//! a ledger of applied keys so a retried write is answered from the ledger
//! instead of being applied twice, and `lookup` lets the coordinator check
//! whether an interrupted write already landed.

pub mod http;
pub mod memory;

pub use http::HttpRemoteStore;
pub use memory::{InMemoryRemoteStore, RemoteCall, RemoteMethod};

use crate::error::SyncResult;
use crate::queue::OperationKind;
use crate::types::{Document, RecordVersion};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Authoritative copy of a document as returned by the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub data: Document,
    pub version: String,
    /// Remote last-modified time, unix millis
    pub modified_at: Option<i64>,
}

impl RemoteRecord {
    pub fn record_version(&self) -> RecordVersion {
        RecordVersion {
            version: self.version.clone(),
            modified_at: self.modified_at,
        }
    }
}

/// Ledger entry for an applied write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteReceipt {
    pub idempotency_key: String,
    pub collection: String,
    pub document_id: String,
    pub kind: OperationKind,
    /// Resulting record; `None` for deletes
    pub record: Option<RemoteRecord>,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn create(
        &self,
        collection: &str,
        id: &str,
        data: &Document,
        idempotency_key: &str,
    ) -> SyncResult<RemoteRecord>;

    async fn read(&self, collection: &str, id: &str) -> SyncResult<Option<RemoteRecord>>;

    /// Shallow merge of `patch` into the stored document.
    async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: &Document,
        idempotency_key: &str,
    ) -> SyncResult<RemoteRecord>;

    async fn delete(&self, collection: &str, id: &str, idempotency_key: &str) -> SyncResult<()>;

    /// Find the write applied under `idempotency_key`, if any.
    async fn lookup(&self, idempotency_key: &str) -> SyncResult<Option<WriteReceipt>>;
}
