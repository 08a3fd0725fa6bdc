use super::DurableStorage;
use crate::error::{SyncError, SyncResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// In-process storage used by tests and ephemeral sessions.
///
/// `set_failing(true)` makes every mutation fail with `SyncError::Storage`,
/// which is how tests exercise the storage-fault path.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    failing: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    fn check_writable(&self) -> SyncResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::Storage("storage unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl DurableStorage for MemoryStorage {
    async fn get(&self, key: &str) -> SyncResult<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> SyncResult<()> {
        self.check_writable()?;
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> SyncResult<()> {
        self.check_writable()?;
        self.entries.write().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> SyncResult<Vec<(String, Vec<u8>)>> {
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
