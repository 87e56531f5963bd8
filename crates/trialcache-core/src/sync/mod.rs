//! Per-table synchronization with a remote source.
//!
//! A table participates by implementing `Replicable`: it exposes its
//! `ReplicaTable`, the `RemoteSource` it syncs against, and a conflict hook.
//! The default `sync` pulls remote changes since the last incremental sync
//! (or everything, when the local cache is empty) and the default
//! `push_pending` drains the table's queued local mutations. Neither ever
//! returns an error; failures are reported in `SyncResult::error` and in the
//! table's `SyncMetadata`.

pub mod conflict;
pub mod pull;
pub mod push;
pub mod remote;
pub mod table;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;
use crate::store::VersionedRow;
use crate::table::{ReplicaTable, RowData};

pub use conflict::{ConflictResolver, FieldAuthorityMerge, ServerAuthoritative};
pub use remote::{RemoteError, RemoteRow, RemoteSource};
pub use table::SyncedTable;

/// Outcome of one sync or push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct SyncResult {
    pub success: bool,
    #[cfg_attr(feature = "ts", ts(type = "number"))]
    pub rows_affected: u64,
    #[cfg_attr(feature = "ts", ts(type = "number"))]
    pub conflicts_resolved: u64,
    #[cfg_attr(feature = "ts", ts(type = "number"))]
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl SyncResult {
    pub fn new(rows_affected: u64, conflicts_resolved: u64, duration: Duration, error: Option<String>) -> Self {
        Self {
            success: error.is_none(),
            rows_affected,
            conflicts_resolved,
            duration_ms: duration.as_millis() as u64,
            error,
        }
    }

    pub fn failed(error: impl Into<String>, duration: Duration) -> Self {
        Self::new(0, 0, duration, Some(error.into()))
    }
}

#[async_trait]
pub trait Replicable: Send + Sync {
    type Row: RowData;

    fn replica(&self) -> &ReplicaTable<Self::Row>;

    fn remote(&self) -> &dyn RemoteSource;

    /// Row to store when a remote row arrives for an id that is cached locally.
    fn resolve_conflict(&self, local: &VersionedRow<Self::Row>, remote: Self::Row) -> Self::Row;

    /// Retries for a row write that races a local edit.
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    async fn sync(&self, tenant_key: &str) -> SyncResult {
        let resolve =
            |local: &VersionedRow<Self::Row>, remote: Self::Row| self.resolve_conflict(local, remote);
        pull::pull(
            self.replica(),
            self.remote(),
            tenant_key,
            &resolve,
            self.retry_policy(),
        )
        .await
    }

    async fn push_pending(&self) -> SyncResult {
        push::push_pending(self.replica(), self.remote()).await
    }
}
