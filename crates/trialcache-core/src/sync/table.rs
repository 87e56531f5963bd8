use std::sync::Arc;

use super::conflict::ConflictResolver;
use super::remote::RemoteSource;
use super::Replicable;
use crate::retry::RetryPolicy;
use crate::store::VersionedRow;
use crate::table::{ReplicaTable, RowData};

/// A replica table bound to a remote source and a conflict policy. Wrap a
/// `ReplicaTable` with `SyncedTable::new(table, remote, ServerAuthoritative)`
/// and call `sync(license_key)` or `push_pending()` through `Replicable`.
pub struct SyncedTable<T, C> {
    replica: ReplicaTable<T>,
    remote: Arc<dyn RemoteSource>,
    resolver: C,
    retry: RetryPolicy,
}

impl<T, C> SyncedTable<T, C>
where
    T: RowData,
    C: ConflictResolver<T>,
{
    pub fn new(replica: ReplicaTable<T>, remote: Arc<dyn RemoteSource>, resolver: C) -> Self {
        Self {
            replica,
            remote,
            resolver,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn resolver(&self) -> &C {
        &self.resolver
    }
}

impl<T, C> Replicable for SyncedTable<T, C>
where
    T: RowData,
    C: ConflictResolver<T>,
{
    type Row = T;

    fn replica(&self) -> &ReplicaTable<T> {
        &self.replica
    }

    fn remote(&self) -> &dyn RemoteSource {
        self.remote.as_ref()
    }

    fn resolve_conflict(&self, local: &VersionedRow<T>, remote: T) -> T {
        self.resolver.resolve(local, remote)
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }
}
