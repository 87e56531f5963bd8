//! Pull remote changes into a table.

use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::remote::RemoteSource;
use super::SyncResult;
use crate::error::{ReplicaError, Result};
use crate::retry::{retry_on_conflict, RetryError, RetryPolicy};
use crate::store::{RowStore, SyncMetadata, SyncStatus, VersionedRow, WriteOptions};
use crate::table::{ReplicaTable, RowData};

#[derive(Debug, Default)]
struct Applied {
    rows: u64,
    conflicts: u64,
    failures: Vec<String>,
}

/// Fetch rows changed since the last incremental sync and merge them in.
///
/// An empty cache, or a table that never synced, pulls everything from the
/// epoch. The cursor only advances when every row was applied. Metadata is
/// written on every call.
pub async fn pull<T, F>(
    table: &ReplicaTable<T>,
    remote: &dyn RemoteSource,
    tenant_key: &str,
    resolve: &F,
    policy: RetryPolicy,
) -> SyncResult
where
    T: RowData,
    F: Fn(&VersionedRow<T>, T) -> T + Sync,
{
    let started = Instant::now();
    let started_at = Utc::now();
    let name = table.name();

    let store = match table.row_store().await {
        Ok(store) => store,
        Err(e) => {
            warn!(table = %name, error = %e, "Sync skipped");
            return SyncResult::failed(e.to_string(), started.elapsed());
        }
    };

    let mut meta = match begin(store, name).await {
        Ok(meta) => meta,
        Err(e) => {
            warn!(table = %name, error = %e, "Could not record sync start");
            return SyncResult::failed(e.to_string(), started.elapsed());
        }
    };

    let cached = store.count(name).await.unwrap_or(0);
    let full = cached == 0 || meta.last_incremental_sync_at.is_none();
    let since = match meta.last_incremental_sync_at {
        Some(at) if !full => at,
        _ => DateTime::<Utc>::UNIX_EPOCH,
    };
    debug!(table = %name, full, since = %since, "Fetching remote changes");

    let (applied, error) = match remote.fetch_changed(name, since, tenant_key).await {
        Ok(rows) => {
            let mut applied = Applied::default();
            for row in rows {
                apply(store, name, row.id, row.data, resolve, policy, &mut applied).await;
            }
            let error = summarize(&applied.failures);
            (applied, error)
        }
        Err(e) => {
            let e = ReplicaError::SyncFailed(e.to_string());
            (Applied::default(), Some(e.to_string()))
        }
    };

    meta.conflict_count += applied.conflicts;
    if let Ok(pending) = store.pending_count(name).await {
        meta.pending_mutation_count = pending;
    }
    match &error {
        None => {
            meta.sync_status = SyncStatus::Idle;
            meta.error_message = None;
            meta.last_incremental_sync_at = Some(started_at);
            if full {
                meta.last_full_sync_at = Some(started_at);
            }
        }
        Some(message) => {
            meta.sync_status = SyncStatus::Error;
            meta.error_message = Some(message.clone());
        }
    }
    if let Err(e) = store.save_metadata(&meta).await {
        warn!(table = %name, error = %e, "Could not record sync result");
    }

    if applied.rows > 0 {
        table.notify_changed();
    }

    let result = SyncResult::new(applied.rows, applied.conflicts, started.elapsed(), error);
    if result.success {
        info!(
            table = %name,
            full,
            rows = result.rows_affected,
            conflicts = result.conflicts_resolved,
            duration_ms = result.duration_ms,
            "Sync complete"
        );
    } else {
        warn!(
            table = %name,
            rows = result.rows_affected,
            error = result.error.as_deref().unwrap_or_default(),
            "Sync failed"
        );
    }
    result
}

async fn begin(store: &RowStore, table: &str) -> Result<SyncMetadata> {
    let mut meta = store
        .load_metadata(table)
        .await?
        .unwrap_or_else(|| SyncMetadata::new(table));
    meta.sync_status = SyncStatus::Syncing;
    store.save_metadata(&meta).await?;
    Ok(meta)
}

async fn apply<T, F>(
    store: &RowStore,
    table: &str,
    id: String,
    data: serde_json::Value,
    resolve: &F,
    policy: RetryPolicy,
    applied: &mut Applied,
) where
    T: RowData,
    F: Fn(&VersionedRow<T>, T) -> T + Sync,
{
    let incoming: T = match serde_json::from_value(data) {
        Ok(incoming) => incoming,
        Err(e) => {
            warn!(table, id = %id, error = %e, "Skipping undecodable remote row");
            applied.failures.push(format!("{}: {}", id, e));
            return;
        }
    };

    let outcome = retry_on_conflict(
        policy,
        |_| apply_row(store, table, &id, &incoming, resolve),
        ReplicaError::is_conflict,
    )
    .await;

    match outcome {
        Ok(conflict) => {
            applied.rows += 1;
            if conflict {
                applied.conflicts += 1;
            }
        }
        Err(RetryError::Exhausted { last, .. }) | Err(RetryError::Failed(last)) => {
            warn!(table, id = %id, error = %last, "Remote row not applied");
            applied.failures.push(format!("{}: {}", id, last));
        }
    }
}

/// Write one remote row. Returns whether a local copy had to be resolved.
async fn apply_row<T, F>(store: &RowStore, table: &str, id: &str, incoming: &T, resolve: &F) -> Result<bool>
where
    T: RowData,
    F: Fn(&VersionedRow<T>, T) -> T + Sync,
{
    match store.peek::<T>(table, id).await? {
        Some(local) => {
            let merged = resolve(&local, incoming.clone());
            // Still dirty only if a local edit survived the merge.
            let dirty = local.is_dirty && serde_json::to_value(&merged)? != serde_json::to_value(incoming)?;
            store
                .set(table, id, &merged, WriteOptions::remote(dirty, local.version))
                .await?;
            Ok(true)
        }
        None => {
            store
                .set(table, id, incoming, WriteOptions::remote(false, 0))
                .await?;
            Ok(false)
        }
    }
}

fn summarize(failures: &[String]) -> Option<String> {
    match failures {
        [] => None,
        [only] => Some(only.clone()),
        [first, rest @ ..] => Some(format!("{} (and {} more)", first, rest.len())),
    }
}
