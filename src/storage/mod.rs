//! Durable local storage
//!
//! A narrow key-prefixed key/value interface shared by the cache and the
//! operation queue. Each component owns its own key prefix.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use crate::error::SyncResult;

/// Key-prefixed persistence used by `CacheStore` and `LocalOperationQueue`.
///
/// Every `set` must be atomic for its key: after a crash a key holds either
/// its previous or its new value, never a torn write.
#[async_trait::async_trait]
pub trait DurableStorage: Send + Sync {
    async fn get(&self, key: &str) -> SyncResult<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>) -> SyncResult<()>;

    async fn delete(&self, key: &str) -> SyncResult<()>;

    /// All entries whose key starts with `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> SyncResult<Vec<(String, Vec<u8>)>>;
}
