//! SQLite-backed durable storage
//!
//! One `kv` table keyed by the component prefix. WAL journaling with
//! `synchronous = FULL` so a committed `set` survives a crash.

use super::DurableStorage;
use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::debug;

pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> SyncResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        debug!("Opened sync storage at {}", path.as_ref().display());
        Self::with_connection(conn)
    }

    /// Open a store in the default location (user data directory)
    pub fn open_default(app_name: &str) -> SyncResult<Self> {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| {
                std::env::current_dir().unwrap_or_else(|_| Path::new(".").to_path_buf())
            })
            .join(app_name);
        std::fs::create_dir_all(&data_dir)?;
        Self::open(data_dir.join("sync.db"))
    }

    pub fn open_in_memory() -> SyncResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> SyncResult<Self> {
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait::async_trait]
impl DurableStorage for SqliteStorage {
    async fn get(&self, key: &str) -> SyncResult<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT value FROM kv WHERE key = ?1")?;
        let value = stmt
            .query_row(params![key], |row| row.get::<_, Vec<u8>>(0))
            .optional()?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> SyncResult<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
             value = excluded.value,
             updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> SyncResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> SyncResult<Vec<(String, Vec<u8>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT key, value FROM kv
             WHERE substr(key, 1, length(?1)) = ?1
             ORDER BY key",
        )?;
        let rows = stmt.query_map(params![prefix], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| SyncError::Storage(e.to_string()))
    }
}
