//! Common test utilities for sync engine tests
//!
//! Provides shared helpers for:
//! - Building engines over in-memory storage and an in-memory remote
//! - Flipping connectivity through a manual signal
//! - Building JSON documents

#![allow(dead_code)]

use labsync::{
    Document, DurableStorage, InMemoryRemoteStore, ManualSignal, MemoryStorage, SqliteStorage,
    SyncConfig, SyncEngine,
};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

pub struct TestEngine {
    pub engine: Arc<SyncEngine>,
    pub remote: Arc<InMemoryRemoteStore>,
    pub signal: Arc<ManualSignal>,
    pub storage: Arc<dyn DurableStorage>,
}

impl TestEngine {
    pub fn go_offline(&self) {
        self.signal.set_online(false);
    }

    pub fn go_online(&self) {
        self.signal.set_online(true);
    }
}

/// No background task, no sync on write: tests drive every pass.
pub fn quiet_config() -> SyncConfig {
    SyncConfig {
        auto_sync: false,
        sync_on_write: false,
        ..SyncConfig::default()
    }
}

pub fn doc(value: Value) -> Document {
    labsync::types::into_document(value).expect("test documents are JSON objects")
}

pub async fn build_engine(
    storage: Arc<dyn DurableStorage>,
    remote: Arc<InMemoryRemoteStore>,
    online: bool,
    config: SyncConfig,
) -> TestEngine {
    let signal = Arc::new(ManualSignal::new(online));
    let engine = SyncEngine::builder(storage.clone(), remote.clone())
        .config(config)
        .signal(signal.clone())
        .build()
        .await
        .expect("Failed to build sync engine");
    TestEngine {
        engine,
        remote,
        signal,
        storage,
    }
}

pub async fn create_test_engine(online: bool) -> TestEngine {
    build_engine(
        Arc::new(MemoryStorage::new()),
        Arc::new(InMemoryRemoteStore::new()),
        online,
        quiet_config(),
    )
    .await
}

pub async fn create_sqlite_engine(path: &Path, remote: Arc<InMemoryRemoteStore>, online: bool) -> TestEngine {
    let storage = SqliteStorage::open(path).expect("Failed to open sqlite storage");
    build_engine(Arc::new(storage), remote, online, quiet_config()).await
}
