//! Typed, per-table facade over the shared row store.
//!
//! A `ReplicaTable<T>` owns the lifecycle of its rows: it connects through the
//! bootstrap coordinator on first use, applies its TTL on reads, schedules a
//! change notification after every mutation, and short-circuits to empty
//! reads and `StoreUnavailable` writes while replication is disabled.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::bootstrap::BootstrapCoordinator;
use crate::config::ReplicaConfig;
use crate::error::{ReplicaError, Result};
use crate::eviction::{self, EvictionOptions, EvictionReport};
use crate::expiration::{ExpirationPolicy, NetworkStatus};
use crate::notify::{ChangeNotifier, Listener, RowLoader, Subscription};
use crate::retry::{retry_on_conflict, RetryError, RetryPolicy};
use crate::store::{
    MutationStatus, PendingMutation, RowStore, SyncMetadata, TableStats, VersionedRow, WriteOptions,
};

/// Bounds on the payload type of a table.
pub trait RowData: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> RowData for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Per-table settings, normally derived from `ReplicaConfig`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableOptions {
    pub ttl: Duration,
    pub size_budget: Option<u64>,
    pub protection_window: Duration,
    pub chunk_size: usize,
    pub debounce: Duration,
}

impl TableOptions {
    pub fn from_config(config: &ReplicaConfig, table: &str) -> Self {
        Self {
            ttl: config.ttl(table),
            size_budget: config.size_budget(table),
            protection_window: config.protection_window(),
            chunk_size: config.batch_chunk_size.max(1),
            debounce: config.debounce(),
        }
    }
}

impl Default for TableOptions {
    fn default() -> Self {
        Self::from_config(&ReplicaConfig::default(), "")
    }
}

struct TableInner<T> {
    name: String,
    coordinator: BootstrapCoordinator,
    store: OnceCell<RowStore>,
    options: TableOptions,
    network: NetworkStatus,
    notifier: ChangeNotifier<T>,
}

pub struct ReplicaTable<T> {
    inner: Arc<TableInner<T>>,
}

impl<T> Clone for ReplicaTable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: RowData> ReplicaTable<T> {
    pub fn new(
        name: impl Into<String>,
        coordinator: BootstrapCoordinator,
        network: NetworkStatus,
        options: TableOptions,
    ) -> Self {
        let name = name.into();
        let inner = Arc::new_cyclic(|weak: &Weak<TableInner<T>>| {
            let weak = weak.clone();
            let loader: RowLoader<T> = Arc::new(move || {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(inner) => ReplicaTable { inner }.get_all(None).await,
                        None => Vec::new(),
                    }
                }
                .boxed()
            });
            TableInner {
                notifier: ChangeNotifier::new(name.clone(), options.debounce, loader),
                name,
                coordinator,
                store: OnceCell::new(),
                options,
                network,
            }
        });
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn options(&self) -> &TableOptions {
        &self.inner.options
    }

    pub fn network(&self) -> &NetworkStatus {
        &self.inner.network
    }

    pub fn coordinator(&self) -> &BootstrapCoordinator {
        &self.inner.coordinator
    }

    pub fn policy(&self) -> ExpirationPolicy {
        ExpirationPolicy::new(self.inner.options.ttl, self.inner.network.is_online())
    }

    /// Shared store handle, connecting on first use.
    pub(crate) async fn row_store(&self) -> Result<&RowStore> {
        if self.inner.coordinator.replication_disabled() {
            return Err(ReplicaError::StoreUnavailable(
                "replication disabled".to_string(),
            ));
        }
        self.inner
            .store
            .get_or_try_init(|| async {
                let db = self.inner.coordinator.connect(&self.inner.name).await?;
                debug!(table = %self.inner.name, "Table connected");
                Ok::<_, ReplicaError>(RowStore::new(db))
            })
            .await
    }

    pub(crate) fn notify_changed(&self) {
        self.inner.notifier.schedule();
    }

    fn log_read_failure(&self, operation: &str, e: &ReplicaError) {
        if e.is_transient() {
            warn!(table = %self.inner.name, operation, error = %e, "Read treated as miss");
        } else {
            warn!(table = %self.inner.name, operation, error = %e, "Read failed");
        }
    }

    // ===== Reads =====

    pub async fn try_get(&self, id: &str) -> Result<Option<VersionedRow<T>>> {
        let policy = self.policy();
        self.row_store().await?.get(&self.inner.name, id, policy).await
    }

    /// Payload for `id`. Misses, expired rows, and store failures are all
    /// `None`.
    pub async fn get(&self, id: &str) -> Option<T> {
        match self.try_get(id).await {
            Ok(row) => row.map(|r| r.data),
            Err(e) => {
                self.log_read_failure("get", &e);
                None
            }
        }
    }

    pub async fn try_get_all(&self, partition: Option<&str>) -> Result<Vec<VersionedRow<T>>> {
        let policy = self.policy();
        self.row_store()
            .await?
            .scan(&self.inner.name, partition, policy)
            .await
    }

    /// Every live row, optionally limited to one tenant partition.
    pub async fn get_all(&self, partition: Option<&str>) -> Vec<T> {
        match self.try_get_all(partition).await {
            Ok(rows) => rows.into_iter().map(|r| r.data).collect(),
            Err(e) => {
                self.log_read_failure("get_all", &e);
                Vec::new()
            }
        }
    }

    pub async fn query_by_index(&self, field: &str, value: &Value) -> Vec<T> {
        let policy = self.policy();
        let result = match self.row_store().await {
            Ok(store) => {
                store
                    .query_by_index::<T>(&self.inner.name, field, value, policy)
                    .await
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(rows) => rows.into_iter().map(|r| r.data).collect(),
            Err(e) => {
                self.log_read_failure("query_by_index", &e);
                Vec::new()
            }
        }
    }

    pub async fn count(&self) -> Result<u64> {
        self.row_store().await?.count(&self.inner.name).await
    }

    pub async fn stats(&self) -> Result<TableStats> {
        self.row_store().await?.stats(&self.inner.name).await
    }

    /// Stored sync metadata, or a fresh record if this table never synced.
    pub async fn sync_metadata(&self) -> Result<SyncMetadata> {
        let stored = self
            .row_store()
            .await?
            .load_metadata(&self.inner.name)
            .await?;
        Ok(stored.unwrap_or_else(|| SyncMetadata::new(self.inner.name.clone())))
    }

    // ===== Writes =====

    /// Write `data` under `id`, returning the new version.
    pub async fn set(&self, id: &str, data: &T, dirty: bool) -> Result<u64> {
        self.write(id, data, WriteOptions::local(dirty)).await
    }

    /// Write only if the stored version still equals `expected_version`
    /// (`0` meaning the row must not exist yet).
    pub async fn set_versioned(
        &self,
        id: &str,
        data: &T,
        dirty: bool,
        expected_version: u64,
    ) -> Result<u64> {
        self.write(id, data, WriteOptions::local(dirty).expecting(expected_version))
            .await
    }

    async fn write(&self, id: &str, data: &T, options: WriteOptions) -> Result<u64> {
        let version = self
            .row_store()
            .await?
            .set(&self.inner.name, id, data, options)
            .await?;
        self.notify_changed();
        Ok(version)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let removed = self.row_store().await?.delete(&self.inner.name, id).await?;
        if removed {
            self.notify_changed();
        }
        Ok(())
    }

    /// Replace rows wholesale for hydration. Every row restarts at version 1.
    pub async fn batch_set(&self, items: &[(String, T)], dirty: bool) -> Result<usize> {
        let written = self
            .row_store()
            .await?
            .batch_set(&self.inner.name, items, dirty)
            .await?;
        self.notify_changed();
        Ok(written)
    }

    /// `batch_set` in slices of the configured chunk size, reporting
    /// `(written, total)` after each slice.
    pub async fn batch_set_chunked<F>(
        &self,
        items: &[(String, T)],
        dirty: bool,
        mut progress: F,
    ) -> Result<usize>
    where
        F: FnMut(usize, usize),
    {
        let store = self.row_store().await?;
        let total = items.len();
        let mut written = 0;
        for chunk in items.chunks(self.inner.options.chunk_size.max(1)) {
            written += store.batch_set(&self.inner.name, chunk, dirty).await?;
            progress(written, total);
        }
        debug!(table = %self.inner.name, written, "Chunked batch written");
        self.notify_changed();
        Ok(written)
    }

    /// Record a local edit that must eventually reach the remote source:
    /// writes the row dirty and queues a pending mutation for it.
    pub async fn stage(&self, id: &str, data: &T) -> Result<u64> {
        let version = self.set(id, data, true).await?;
        let store = self.row_store().await?;
        let queued = store
            .list_mutations(
                Some(&self.inner.name),
                &[MutationStatus::Queued, MutationStatus::Failed],
            )
            .await?;
        if !queued.iter().any(|m| m.row_id == id) {
            store
                .enqueue_mutation(&PendingMutation::new(self.inner.name.clone(), id))
                .await?;
        }
        Ok(version)
    }

    /// Read-modify-write that never loses a concurrent update. `update` may
    /// run more than once and should be free of side effects.
    pub async fn optimistic_update<F>(&self, id: &str, update: F, policy: RetryPolicy) -> Result<u64>
    where
        F: Fn(T) -> T,
    {
        let store = self.row_store().await?;
        let table = self.inner.name.as_str();
        let update = &update;
        let result = retry_on_conflict(
            policy,
            |_| async move {
                let current = store
                    .get::<T>(table, id, self.policy())
                    .await?
                    .ok_or_else(|| ReplicaError::NotFound {
                        table: table.to_string(),
                        id: id.to_string(),
                    })?;
                let next = update(current.data);
                store
                    .set(table, id, &next, WriteOptions::local(true).expecting(current.version))
                    .await
            },
            ReplicaError::is_conflict,
        )
        .await;

        match result {
            Ok(version) => {
                self.notify_changed();
                Ok(version)
            }
            Err(RetryError::Exhausted { retries, last }) => {
                warn!(table, id, retries, error = %last, "Optimistic update gave up");
                Err(ReplicaError::UpdateFailed {
                    table: table.to_string(),
                    id: id.to_string(),
                    retries,
                })
            }
            Err(RetryError::Failed(e)) => Err(e),
        }
    }

    // ===== Maintenance =====

    /// Purge stale clean rows now instead of waiting for them to be read.
    pub async fn clean_expired(&self) -> Result<usize> {
        let policy = self.policy();
        let removed = self
            .row_store()
            .await?
            .clean_expired(&self.inner.name, policy)
            .await?;
        if removed > 0 {
            info!(table = %self.inner.name, removed, "Expired rows purged");
            self.notify_changed();
        }
        Ok(removed)
    }

    /// Bring the table under `budget_bytes`. Emits one notification at most.
    pub async fn evict(&self, budget_bytes: u64) -> Result<EvictionReport> {
        let options = EvictionOptions::new(budget_bytes, self.inner.options.protection_window);
        self.evict_with(&options).await
    }

    pub async fn evict_with(&self, options: &EvictionOptions) -> Result<EvictionReport> {
        let store = self.row_store().await?;
        let report = eviction::evict(store, &self.inner.name, options).await?;
        if report.evicted > 0 {
            self.notify_changed();
        }
        Ok(report)
    }

    /// Evict against the configured budget; `None` if the table has none.
    pub async fn evict_if_needed(&self) -> Result<Option<EvictionReport>> {
        match self.inner.options.size_budget {
            Some(budget) => self.evict(budget).await.map(Some),
            None => Ok(None),
        }
    }

    // ===== Subscriptions =====

    /// Register `listener`; it receives the current rows immediately and
    /// again after each quiet period following a change.
    pub async fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&[T]) + Send + Sync + 'static,
    {
        let listener: Listener<T> = Arc::new(listener);
        self.inner.notifier.subscribe(listener).await
    }

    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.inner.notifier.unsubscribe(subscription.id())
    }
}
