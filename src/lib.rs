pub mod cache;
pub mod config;
pub mod error;
pub mod network;
pub mod queue;
pub mod remote;
pub mod storage;
pub mod sync;
pub mod types;

pub use cache::{CacheStore, CachedRecord, Filter, LocalMutation, RemoteSnapshot};
pub use config::SyncConfig;
pub use error::{ErrorKind, SyncError, SyncResult};
pub use network::{ConnectivitySignal, HttpProbeSignal, ManualSignal, NetworkMonitor};
pub use queue::{
    EnqueueOutcome, LocalOperationQueue, OperationKind, OperationStatus, QueueConfig,
    QueuedOperation, RetryPolicy,
};
pub use remote::{HttpRemoteStore, InMemoryRemoteStore, RemoteRecord, RemoteStore, WriteReceipt};
pub use storage::{DurableStorage, MemoryStorage, SqliteStorage};
pub use sync::{
    ConflictResolution, ConflictResolutionStrategy, ConflictResolver, SyncEngine, SyncOutcome,
    SyncReport, SyncStatus,
};
pub use types::{Document, RecordVersion};
