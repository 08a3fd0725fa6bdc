//! Offline sync
//!
//! - `coordinator`: replays the operation queue against the remote store
//! - `conflict`: pluggable resolution when the remote copy moved on
//! - `status`: progress and error reporting to the UI
//! - `engine`: the facade the application talks to, plus the background task

pub mod conflict;
pub mod coordinator;
pub mod engine;
pub mod status;

pub use conflict::{
    Conflict, ConflictResolution, ConflictResolutionStrategy, ConflictResolver, ConflictResolvers,
    FieldMergeResolver, FnResolver, LastWriteWinsResolver, ManualResolver,
};
pub use coordinator::{SyncCoordinator, SyncOutcome, SyncReport};
pub use engine::{SyncCommand, SyncEngine, SyncEngineBuilder};
pub use status::{
    ListenerError, StatusError, SubscriptionToken, SyncStatus, SyncStatusPublisher,
};
