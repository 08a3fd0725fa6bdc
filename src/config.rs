//! Engine configuration
//!
//! `SyncConfig` can be built from defaults, a TOML file, or `LABSYNC_*`
//! environment variables (a `.env` file is honoured through `dotenvy`).

use crate::error::{SyncError, SyncResult};
use crate::queue::{QueueConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Configuration for the sync engine
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Background sync interval when online
    pub sync_interval_secs: u64,
    /// Timeout applied to every remote call
    pub request_timeout_ms: u64,
    /// Enable periodic background sync
    pub auto_sync: bool,
    /// Attempt a sync right after each local write when online
    pub sync_on_write: bool,
    pub retry: RetryPolicy,
    pub queue: QueueConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: 30,
            request_timeout_ms: 30_000,
            auto_sync: true,
            sync_on_write: true,
            retry: RetryPolicy::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Parse a TOML document. Missing keys fall back to defaults.
    pub fn from_toml_str(raw: &str) -> SyncResult<Self> {
        let config: SyncConfig =
            toml::from_str(raw).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> SyncResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            SyncError::Config(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Defaults overridden by `LABSYNC_*` environment variables.
    pub fn from_env() -> SyncResult<Self> {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from `LABSYNC_*` environment variables.
    pub fn apply_env(&mut self) -> SyncResult<()> {
        if let Some(v) = env_var("LABSYNC_SYNC_INTERVAL_SECS")? {
            self.sync_interval_secs = v;
        }
        if let Some(v) = env_var("LABSYNC_REQUEST_TIMEOUT_MS")? {
            self.request_timeout_ms = v;
        }
        if let Some(v) = env_var("LABSYNC_AUTO_SYNC")? {
            self.auto_sync = v;
        }
        if let Some(v) = env_var("LABSYNC_SYNC_ON_WRITE")? {
            self.sync_on_write = v;
        }
        if let Some(v) = env_var("LABSYNC_BACKOFF_BASE_MS")? {
            self.retry.backoff_base_ms = v;
        }
        if let Some(v) = env_var("LABSYNC_BACKOFF_CAP_MS")? {
            self.retry.backoff_cap_ms = v;
        }
        if let Some(v) = env_var("LABSYNC_MAX_RETRIES")? {
            self.retry.max_retries = v;
        }
        if let Some(v) = env_var("LABSYNC_MAX_RETRY_DURATION_SECS")? {
            self.retry.max_retry_duration_secs = v;
        }
        if let Some(v) = env_var("LABSYNC_QUEUE_MAX_COUNT")? {
            self.queue.max_count = v;
        }
        if let Some(v) = env_var("LABSYNC_QUEUE_MAX_BYTES")? {
            self.queue.max_bytes = v;
        }
        self.validate()
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.retry.max_retries == 0 {
            return Err(SyncError::Config("max_retries must be at least 1".into()));
        }
        if self.retry.backoff_cap_ms < self.retry.backoff_base_ms {
            return Err(SyncError::Config(
                "backoff_cap_ms must not be smaller than backoff_base_ms".into(),
            ));
        }
        if self.queue.max_count == 0 {
            return Err(SyncError::Config("queue.max_count must be positive".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(SyncError::Config("request_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

fn env_var<T: FromStr>(name: &str) -> SyncResult<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| SyncError::Config(format!("invalid value for {}: {}", name, raw))),
        Err(_) => Ok(None),
    }
}
