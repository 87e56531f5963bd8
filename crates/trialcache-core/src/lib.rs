//! Offline-first local replica engine.
//!
//! Tables of server data are cached in one shared SQLite store so the app
//! keeps working without a network. Each cached row carries a version for
//! optimistic concurrency, a dirty flag protecting unsynced edits, and access
//! bookkeeping for TTL expiration and size-bounded eviction. Tables notify
//! subscribers of changes with a debounce, and sync against a remote source
//! through the `Replicable` contract.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod eviction;
pub mod expiration;
pub mod models;
pub mod notify;
pub mod retry;
pub mod store;
pub mod sync;
pub mod table;

pub use bootstrap::{BootstrapCoordinator, BootstrapPhase};
pub use config::{ReplicaConfig, TableConfig};
pub use error::{ReplicaError, Result};
pub use eviction::{EvictionOptions, EvictionReport, EvictionWeights};
pub use expiration::{ExpirationPolicy, NetworkStatus};
pub use notify::Subscription;
pub use retry::RetryPolicy;
pub use store::{RowStore, RowSyncStatus, SyncMetadata, SyncStatus, TableStats, VersionedRow};
pub use sync::{
    ConflictResolver, FieldAuthorityMerge, RemoteError, RemoteRow, RemoteSource, Replicable,
    ServerAuthoritative, SyncResult, SyncedTable,
};
pub use table::{ReplicaTable, RowData, TableOptions};
