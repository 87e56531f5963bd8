//! Drain a table's pending mutations to the remote source.

use std::time::Instant;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::remote::{RemoteRow, RemoteSource};
use super::SyncResult;
use crate::error::{ReplicaError, Result};
use crate::store::{MutationStatus, PendingMutation, RowStore, RowSyncStatus, SyncMetadata, SyncStatus};
use crate::table::{ReplicaTable, RowData};

enum Pushed {
    Confirmed,
    /// The row changed while in flight; it stays dirty for the next push.
    Superseded,
    /// The row is gone locally; nothing left to send.
    Vanished,
}

/// Send every queued, failed, or interrupted mutation of `table`, oldest
/// first. A confirmed push clears the row's dirty flag only if nobody wrote
/// it meanwhile. A failed push leaves the row dirty and the mutation
/// `failed` for the next attempt.
pub async fn push_pending<T: RowData>(table: &ReplicaTable<T>, remote: &dyn RemoteSource) -> SyncResult {
    let started = Instant::now();
    let name = table.name();

    let store = match table.row_store().await {
        Ok(store) => store,
        Err(e) => {
            warn!(table = %name, error = %e, "Push skipped");
            return SyncResult::failed(e.to_string(), started.elapsed());
        }
    };

    let mutations = match store
        .list_mutations(
            Some(name),
            &[
                MutationStatus::Queued,
                MutationStatus::Failed,
                MutationStatus::Sending,
            ],
        )
        .await
    {
        Ok(mutations) => mutations,
        Err(e) => return SyncResult::failed(e.to_string(), started.elapsed()),
    };
    if mutations.is_empty() {
        debug!(table = %name, "Nothing to push");
        return SyncResult::new(0, 0, started.elapsed(), None);
    }

    let mut pushed = 0u64;
    let mut failures = Vec::new();
    let mut changed = false;
    for mutation in &mutations {
        match push_one(store, remote, mutation).await {
            Ok(Pushed::Confirmed) => {
                pushed += 1;
                changed = true;
            }
            Ok(Pushed::Superseded) => pushed += 1,
            Ok(Pushed::Vanished) => {}
            Err(message) => failures.push(message),
        }
    }

    let error = match failures.as_slice() {
        [] => None,
        [only] => Some(only.clone()),
        [first, rest @ ..] => Some(format!("{} (and {} more)", first, rest.len())),
    };
    if let Err(e) = record(store, name, error.as_deref()).await {
        warn!(table = %name, error = %e, "Could not record push result");
    }
    if changed {
        table.notify_changed();
    }

    let result = SyncResult::new(pushed, 0, started.elapsed(), error);
    info!(
        table = %name,
        pushed,
        failed = failures.len(),
        duration_ms = result.duration_ms,
        "Push complete"
    );
    result
}

async fn push_one(
    store: &RowStore,
    remote: &dyn RemoteSource,
    mutation: &PendingMutation,
) -> std::result::Result<Pushed, String> {
    let table = mutation.table.as_str();
    let id = mutation.row_id.as_str();
    let describe = |e: ReplicaError| format!("{}: {}", id, e);

    let Some(row) = store.peek::<Value>(table, id).await.map_err(describe)? else {
        store
            .remove_mutation(&mutation.mutation_id)
            .await
            .map_err(describe)?;
        debug!(table, id, "Row deleted before push, mutation dropped");
        return Ok(Pushed::Vanished);
    };

    store
        .update_mutation(&mutation.mutation_id, MutationStatus::Sending, None)
        .await
        .map_err(describe)?;

    let outgoing = RemoteRow {
        id: row.id.clone(),
        data: row.data,
        updated_at: Some(row.last_modified_at),
    };
    match remote.push_row(table, outgoing).await {
        Ok(()) => {
            let cleared = store
                .mark_synced(table, id, row.version)
                .await
                .map_err(describe)?;
            store
                .remove_mutation(&mutation.mutation_id)
                .await
                .map_err(describe)?;
            if cleared {
                Ok(Pushed::Confirmed)
            } else {
                debug!(table, id, version = row.version, "Row rewritten during push, left dirty");
                Ok(Pushed::Superseded)
            }
        }
        Err(e) => {
            warn!(table, id, attempts = mutation.attempts + 1, error = %e, "Push rejected");
            let reason = e.to_string();
            if let Err(store_err) = store
                .update_mutation(&mutation.mutation_id, MutationStatus::Failed, Some(reason.clone()))
                .await
            {
                warn!(table, id, error = %store_err, "Could not record push failure");
            }
            if let Err(store_err) = store.set_row_status(table, id, RowSyncStatus::Error).await {
                warn!(table, id, error = %store_err, "Could not flag row");
            }
            Err(format!("{}: {}", id, reason))
        }
    }
}

async fn record(store: &RowStore, table: &str, error: Option<&str>) -> Result<()> {
    let mut meta = store
        .load_metadata(table)
        .await?
        .unwrap_or_else(|| SyncMetadata::new(table));
    meta.pending_mutation_count = store.pending_count(table).await?;
    match error {
        None => {
            if meta.sync_status == SyncStatus::Error {
                meta.sync_status = SyncStatus::Idle;
                meta.error_message = None;
            }
        }
        Some(message) => {
            meta.sync_status = SyncStatus::Error;
            meta.error_message = Some(message.to_string());
        }
    }
    store.save_metadata(&meta).await
}
