//! Keyed row storage over the shared connection.
//!
//! Every operation names its logical table. Payloads are stored as JSON
//! text; the declared index fields and the partition field are copied into
//! their own columns on write.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::database::Database;
use super::metadata::{SyncMetadata, SyncStatus};
use super::mutations::{MutationStatus, PendingMutation};
use super::row::{from_millis, to_millis, RowFootprint, RowSyncStatus, VersionedRow};
use super::schema::{self, INDEXED_FIELDS, PARTITION_FIELD};
use crate::error::{ReplicaError, Result};
use crate::expiration::ExpirationPolicy;

/// Fixed per-row cost added to the payload size when estimating footprint.
pub const ENVELOPE_OVERHEAD_BYTES: u64 = 96;

const ROW_COLUMNS: &str = "id, data, version, is_dirty, sync_status, last_synced_at, \
                           last_accessed_at, last_modified_at, access_count";

/// Who produced a write. Remote writes always refresh `last_synced_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    pub dirty: bool,
    /// Version the caller last read; `Some(0)` asserts the row does not exist.
    pub expected_version: Option<u64>,
    pub origin: WriteOrigin,
}

impl WriteOptions {
    pub fn local(dirty: bool) -> Self {
        Self {
            dirty,
            expected_version: None,
            origin: WriteOrigin::Local,
        }
    }

    pub fn expecting(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }

    pub fn remote(dirty: bool, expected_version: u64) -> Self {
        Self {
            dirty,
            expected_version: Some(expected_version),
            origin: WriteOrigin::Remote,
        }
    }
}

/// Row counts and footprint for one table.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct TableStats {
    pub table: String,
    pub row_count: u64,
    pub dirty_count: u64,
    pub estimated_bytes: u64,
    pub pending_mutations: u64,
}

/// Raw row as read from the database, payload still encoded.
type RawRow = VersionedRow<String>;

enum Lookup {
    Hit(RawRow),
    Expired,
    Missing,
}

#[derive(Clone, Debug)]
pub struct RowStore {
    db: Database,
}

impl RowStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    // ===== Reads =====

    /// Fetch a row, refreshing its access bookkeeping. Expired rows are
    /// deleted and reported as a miss.
    pub async fn get<T: DeserializeOwned>(
        &self,
        table: &str,
        id: &str,
        policy: ExpirationPolicy,
    ) -> Result<Option<VersionedRow<T>>> {
        let (t, i) = (table.to_string(), id.to_string());
        let now = Utc::now();
        let lookup = self
            .db
            .run("get", move |conn| {
                let tx = conn.transaction()?;
                let found = select_row(&tx, &t, &i)?;
                let Some(mut row) = found else {
                    return Ok(Lookup::Missing);
                };
                if policy.is_expired(row.is_dirty, row.last_synced_at, now) {
                    delete_row(&tx, &t, &i)?;
                    tx.commit()?;
                    return Ok(Lookup::Expired);
                }
                tx.execute(
                    "UPDATE rows SET last_accessed_at = ?3, access_count = access_count + 1 \
                     WHERE table_name = ?1 AND id = ?2",
                    params![t, i, to_millis(now)],
                )?;
                tx.commit()?;
                row.access_count += 1;
                row.last_accessed_at = now;
                Ok(Lookup::Hit(row))
            })
            .await?;

        match lookup {
            Lookup::Hit(row) => Ok(Some(decode(row)?)),
            Lookup::Expired => {
                debug!(table, id, "Row expired on read");
                Ok(None)
            }
            Lookup::Missing => Ok(None),
        }
    }

    /// Fetch a row without touching access bookkeeping or expiring it.
    pub async fn peek<T: DeserializeOwned>(&self, table: &str, id: &str) -> Result<Option<VersionedRow<T>>> {
        let (t, i) = (table.to_string(), id.to_string());
        let row = self
            .db
            .run("peek", move |conn| select_row(conn, &t, &i))
            .await?;
        row.map(decode).transpose()
    }

    /// All live rows of a table, optionally restricted to one partition.
    /// Expired rows found along the way are purged.
    pub async fn scan<T: DeserializeOwned>(
        &self,
        table: &str,
        partition: Option<&str>,
        policy: ExpirationPolicy,
    ) -> Result<Vec<VersionedRow<T>>> {
        let t = table.to_string();
        let partition = partition.map(str::to_string);
        let now = Utc::now();
        let rows = self
            .db
            .run("scan", move |conn| {
                let tx = conn.transaction()?;
                let rows = match partition {
                    Some(ref key) => select_rows(
                        &tx,
                        &t,
                        &format!(
                            "SELECT {} FROM rows WHERE table_name = ?1 AND partition_key = ?2 ORDER BY id",
                            ROW_COLUMNS
                        ),
                        params![t, key],
                    )?,
                    None => select_rows(
                        &tx,
                        &t,
                        &format!("SELECT {} FROM rows WHERE table_name = ?1 ORDER BY id", ROW_COLUMNS),
                        params![t],
                    )?,
                };
                let live = retain_live(&tx, &t, rows, policy, now)?;
                tx.commit()?;
                Ok(live)
            })
            .await?;
        rows.into_iter().map(decode).collect()
    }

    /// Rows whose payload `field` equals `value` exactly. Declared index
    /// fields are narrowed by their index; anything else, and any
    /// non-scalar `value`, is an O(n) scan filtered here.
    pub async fn query_by_index<T: DeserializeOwned>(
        &self,
        table: &str,
        field: &str,
        value: &Value,
        policy: ExpirationPolicy,
    ) -> Result<Vec<VersionedRow<T>>> {
        let column = schema::index_column(field);
        let (Some(column), Some(key)) = (column, schema::query_value(value)) else {
            if column.is_none() {
                let missing = ReplicaError::IndexMissing {
                    table: table.to_string(),
                    field: field.to_string(),
                };
                warn!(error = %missing, "Falling back to full table scan");
            }
            let rows: Vec<VersionedRow<Value>> = self.scan(table, None, policy).await?;
            return matching(rows, field, value);
        };

        let t = table.to_string();
        let now = Utc::now();
        let sql = format!(
            "SELECT {} FROM rows WHERE table_name = ?1 AND {} = ?2 ORDER BY id",
            ROW_COLUMNS, column
        );
        let rows = self
            .db
            .run("query_by_index", move |conn| {
                let tx = conn.transaction()?;
                let rows = select_rows(&tx, &t, &sql, params![t, key])?;
                let live = retain_live(&tx, &t, rows, policy, now)?;
                tx.commit()?;
                Ok(live)
            })
            .await?;
        // The index stores text, so `42` and `"42"` share a key.
        let rows = rows
            .into_iter()
            .map(decode::<Value>)
            .collect::<Result<Vec<_>>>()?;
        matching(rows, field, value)
    }

    pub async fn count(&self, table: &str) -> Result<u64> {
        let t = table.to_string();
        self.db
            .run("count", move |conn| {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM rows WHERE table_name = ?1",
                    params![t],
                    |row| row.get(0),
                )?;
                Ok(n as u64)
            })
            .await
    }

    /// Estimated size and ranking inputs for every row of a table.
    pub async fn footprints(&self, table: &str) -> Result<Vec<RowFootprint>> {
        let t = table.to_string();
        self.db
            .run("footprints", move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, length(CAST(data AS BLOB)) + length(CAST(id AS BLOB)), is_dirty, \
                     last_accessed_at, last_modified_at, access_count \
                     FROM rows WHERE table_name = ?1",
                )?;
                let rows = stmt
                    .query_map(params![t], |row| {
                        let bytes: i64 = row.get(1)?;
                        Ok(RowFootprint {
                            id: row.get(0)?,
                            bytes: bytes.max(0) as u64 + ENVELOPE_OVERHEAD_BYTES,
                            is_dirty: row.get(2)?,
                            last_accessed_at: from_millis(row.get(3)?),
                            last_modified_at: from_millis(row.get(4)?),
                            access_count: row.get::<_, i64>(5)?.max(0) as u64,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
    }

    /// Names of every table holding at least one row or metadata record.
    pub async fn tables(&self) -> Result<Vec<String>> {
        self.db
            .run("tables", |conn| {
                let mut stmt = conn.prepare(
                    "SELECT table_name FROM rows UNION SELECT table_name FROM sync_metadata \
                     ORDER BY 1",
                )?;
                let names = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                Ok(names)
            })
            .await
    }

    pub async fn stats(&self, table: &str) -> Result<TableStats> {
        let t = table.to_string();
        self.db
            .run("stats", move |conn| {
                let (rows, dirty, bytes): (i64, i64, i64) = conn.query_row(
                    "SELECT COUNT(*), COALESCE(SUM(is_dirty), 0), \
                     COALESCE(SUM(length(CAST(data AS BLOB)) + length(CAST(id AS BLOB))), 0) \
                     FROM rows WHERE table_name = ?1",
                    params![t],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )?;
                let pending = count_pending(conn, &t)?;
                Ok(TableStats {
                    table: t,
                    row_count: rows as u64,
                    dirty_count: dirty as u64,
                    estimated_bytes: bytes as u64 + rows as u64 * ENVELOPE_OVERHEAD_BYTES,
                    pending_mutations: pending,
                })
            })
            .await
    }

    // ===== Writes =====

    /// Write one row, bumping its version. Fails with `ConcurrentModification`
    /// and writes nothing when `expected_version` does not match.
    pub async fn set<T: Serialize>(
        &self,
        table: &str,
        id: &str,
        data: &T,
        options: WriteOptions,
    ) -> Result<u64> {
        let encoded = Encoded::new(data)?;
        let (t, i) = (table.to_string(), id.to_string());
        let now = Utc::now();
        self.db
            .run("set", move |conn| {
                let tx = conn.transaction()?;
                let existing: Option<(i64, i64, i64, i64)> = tx
                    .query_row(
                        "SELECT version, last_synced_at, last_accessed_at, access_count \
                         FROM rows WHERE table_name = ?1 AND id = ?2",
                        params![t, i],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                    )
                    .optional()?;

                let found = existing.map(|e| e.0 as u64).unwrap_or(0);
                if let Some(expected) = options.expected_version {
                    if expected != found {
                        return Err(ReplicaError::ConcurrentModification {
                            table: t,
                            id: i,
                            expected,
                            found,
                        });
                    }
                }

                let version = found + 1;
                let now_ms = to_millis(now);
                let last_synced = match (options.origin, options.dirty) {
                    (WriteOrigin::Local, true) => existing.map(|e| e.1).unwrap_or(0),
                    _ => now_ms,
                };
                let (last_accessed, access_count) =
                    existing.map(|e| (e.2, e.3)).unwrap_or((now_ms, 0));
                let status = if options.dirty {
                    RowSyncStatus::Pending
                } else {
                    RowSyncStatus::Synced
                };

                upsert(
                    &tx,
                    &t,
                    &i,
                    &encoded,
                    UpsertFields {
                        version: version as i64,
                        dirty: options.dirty,
                        status,
                        last_synced,
                        last_accessed,
                        last_modified: now_ms,
                        access_count,
                    },
                )?;
                tx.commit()?;
                Ok(version)
            })
            .await
    }

    /// Bulk hydration: every row is replaced outright with version 1.
    pub async fn batch_set<T: Serialize>(
        &self,
        table: &str,
        items: &[(String, T)],
        dirty: bool,
    ) -> Result<usize> {
        let encoded = items
            .iter()
            .map(|(id, data)| Ok((id.clone(), Encoded::new(data)?)))
            .collect::<Result<Vec<_>>>()?;
        let t = table.to_string();
        let now_ms = to_millis(Utc::now());
        self.db
            .run("batch_set", move |conn| {
                let tx = conn.transaction()?;
                for (id, data) in &encoded {
                    upsert(
                        &tx,
                        &t,
                        id,
                        data,
                        UpsertFields {
                            version: 1,
                            dirty,
                            status: if dirty {
                                RowSyncStatus::Pending
                            } else {
                                RowSyncStatus::Synced
                            },
                            last_synced: if dirty { 0 } else { now_ms },
                            last_accessed: now_ms,
                            last_modified: now_ms,
                            access_count: 0,
                        },
                    )?;
                }
                tx.commit()?;
                Ok(encoded.len())
            })
            .await
    }

    /// Delete a row. Deleting a missing row is a no-op.
    pub async fn delete(&self, table: &str, id: &str) -> Result<bool> {
        let (t, i) = (table.to_string(), id.to_string());
        self.db
            .run("delete", move |conn| {
                let removed = conn.execute(
                    "DELETE FROM rows WHERE table_name = ?1 AND id = ?2",
                    params![t, i],
                )?;
                Ok(removed > 0)
            })
            .await
    }

    /// Delete many rows in one transaction, returning how many existed.
    pub async fn delete_many(&self, table: &str, ids: Vec<String>) -> Result<usize> {
        let t = table.to_string();
        self.db
            .run("delete_many", move |conn| {
                let tx = conn.transaction()?;
                let mut removed = 0;
                for id in &ids {
                    removed += delete_row(&tx, &t, id)?;
                }
                tx.commit()?;
                Ok(removed)
            })
            .await
    }

    /// Purge every stale clean row. Nothing is purged while offline.
    pub async fn clean_expired(&self, table: &str, policy: ExpirationPolicy) -> Result<usize> {
        if !policy.online {
            return Ok(0);
        }
        let Some(cutoff) = policy.cutoff(Utc::now()) else {
            return Ok(0);
        };
        let t = table.to_string();
        self.db
            .run("clean_expired", move |conn| {
                let removed = conn.execute(
                    "DELETE FROM rows WHERE table_name = ?1 AND is_dirty = 0 AND last_synced_at < ?2",
                    params![t, to_millis(cutoff)],
                )?;
                Ok(removed)
            })
            .await
    }

    /// Clear the dirty flag once a push is confirmed, but only if nobody
    /// wrote the row after `version` was read.
    pub async fn mark_synced(&self, table: &str, id: &str, version: u64) -> Result<bool> {
        let (t, i) = (table.to_string(), id.to_string());
        let now_ms = to_millis(Utc::now());
        self.db
            .run("mark_synced", move |conn| {
                let updated = conn.execute(
                    "UPDATE rows SET is_dirty = 0, sync_status = ?4, last_synced_at = ?5 \
                     WHERE table_name = ?1 AND id = ?2 AND version = ?3",
                    params![t, i, version as i64, RowSyncStatus::Synced.as_str(), now_ms],
                )?;
                Ok(updated > 0)
            })
            .await
    }

    pub async fn set_row_status(&self, table: &str, id: &str, status: RowSyncStatus) -> Result<()> {
        let (t, i) = (table.to_string(), id.to_string());
        self.db
            .run("set_row_status", move |conn| {
                conn.execute(
                    "UPDATE rows SET sync_status = ?3 WHERE table_name = ?1 AND id = ?2",
                    params![t, i, status.as_str()],
                )?;
                Ok(())
            })
            .await
    }

    // ===== Sync metadata =====

    pub async fn load_metadata(&self, table: &str) -> Result<Option<SyncMetadata>> {
        let t = table.to_string();
        self.db
            .run("load_metadata", move |conn| {
                let meta = conn
                    .query_row(
                        "SELECT table_name, last_full_sync_at, last_incremental_sync_at, sync_status, \
                         conflict_count, pending_mutation_count, error_message \
                         FROM sync_metadata WHERE table_name = ?1",
                        params![t],
                        |row| {
                            Ok(SyncMetadata {
                                table: row.get(0)?,
                                last_full_sync_at: row.get::<_, Option<i64>>(1)?.map(from_millis),
                                last_incremental_sync_at: row
                                    .get::<_, Option<i64>>(2)?
                                    .map(from_millis),
                                sync_status: SyncStatus::parse(&row.get::<_, String>(3)?),
                                conflict_count: row.get::<_, i64>(4)?.max(0) as u64,
                                pending_mutation_count: row.get::<_, i64>(5)?.max(0) as u64,
                                error_message: row.get(6)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(meta)
            })
            .await
    }

    pub async fn save_metadata(&self, meta: &SyncMetadata) -> Result<()> {
        let meta = meta.clone();
        self.db
            .run("save_metadata", move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO sync_metadata (table_name, last_full_sync_at, \
                     last_incremental_sync_at, sync_status, conflict_count, pending_mutation_count, \
                     error_message) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        meta.table,
                        meta.last_full_sync_at.map(to_millis),
                        meta.last_incremental_sync_at.map(to_millis),
                        meta.sync_status.as_str(),
                        meta.conflict_count as i64,
                        meta.pending_mutation_count as i64,
                        meta.error_message,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    // ===== Pending mutations =====

    pub async fn enqueue_mutation(&self, mutation: &PendingMutation) -> Result<()> {
        let m = mutation.clone();
        self.db
            .run("enqueue_mutation", move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO pending_mutations (mutation_id, table_name, row_id, \
                     status, attempts, last_error, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        m.mutation_id,
                        m.table,
                        m.row_id,
                        m.status.as_str(),
                        m.attempts as i64,
                        m.last_error,
                        to_millis(m.created_at),
                        to_millis(m.updated_at),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Mutations in any of `statuses`, oldest first. `None` lists every table.
    pub async fn list_mutations(
        &self,
        table: Option<&str>,
        statuses: &[MutationStatus],
    ) -> Result<Vec<PendingMutation>> {
        let table = table.map(str::to_string);
        let statuses: Vec<&'static str> = statuses.iter().map(|s| s.as_str()).collect();
        self.db
            .run("list_mutations", move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT mutation_id, table_name, row_id, status, attempts, last_error, \
                     created_at, updated_at FROM pending_mutations \
                     WHERE (?1 IS NULL OR table_name = ?1) ORDER BY created_at, mutation_id",
                )?;
                let all = stmt
                    .query_map(params![table], |row| {
                        Ok(PendingMutation {
                            mutation_id: row.get(0)?,
                            table: row.get(1)?,
                            row_id: row.get(2)?,
                            status: MutationStatus::parse(&row.get::<_, String>(3)?),
                            attempts: row.get::<_, i64>(4)?.max(0) as u32,
                            last_error: row.get(5)?,
                            created_at: from_millis(row.get(6)?),
                            updated_at: from_millis(row.get(7)?),
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(all
                    .into_iter()
                    .filter(|m| statuses.contains(&m.status.as_str()))
                    .collect())
            })
            .await
    }

    pub async fn update_mutation(
        &self,
        mutation_id: &str,
        status: MutationStatus,
        error: Option<String>,
    ) -> Result<()> {
        let id = mutation_id.to_string();
        let now_ms = to_millis(Utc::now());
        let bump = i64::from(status == MutationStatus::Sending);
        self.db
            .run("update_mutation", move |conn| {
                conn.execute(
                    "UPDATE pending_mutations SET status = ?2, last_error = ?3, updated_at = ?4, \
                     attempts = attempts + ?5 WHERE mutation_id = ?1",
                    params![id, status.as_str(), error, now_ms, bump],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn remove_mutation(&self, mutation_id: &str) -> Result<()> {
        let id = mutation_id.to_string();
        self.db
            .run("remove_mutation", move |conn| {
                conn.execute(
                    "DELETE FROM pending_mutations WHERE mutation_id = ?1",
                    params![id],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn pending_count(&self, table: &str) -> Result<u64> {
        let t = table.to_string();
        self.db
            .run("pending_count", move |conn| count_pending(conn, &t))
            .await
    }
}

/// Payload serialized once, with its index and partition column values.
struct Encoded {
    json: String,
    index_values: Vec<Option<String>>,
    partition: Option<String>,
}

impl Encoded {
    fn new<T: Serialize>(data: &T) -> Result<Self> {
        let value = serde_json::to_value(data)?;
        Ok(Self {
            json: serde_json::to_string(&value)?,
            index_values: INDEXED_FIELDS
                .iter()
                .map(|f| schema::index_value(&value, f.field))
                .collect(),
            partition: schema::index_value(&value, PARTITION_FIELD),
        })
    }
}

struct UpsertFields {
    version: i64,
    dirty: bool,
    status: RowSyncStatus,
    last_synced: i64,
    last_accessed: i64,
    last_modified: i64,
    access_count: i64,
}

fn upsert(tx: &Transaction<'_>, table: &str, id: &str, data: &Encoded, f: UpsertFields) -> Result<()> {
    tx.execute(
        "INSERT OR REPLACE INTO rows (table_name, id, data, version, is_dirty, sync_status, \
         last_synced_at, last_accessed_at, last_modified_at, access_count, trial_id, class_id, \
         partition_key) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            table,
            id,
            data.json,
            f.version,
            f.dirty,
            f.status.as_str(),
            f.last_synced,
            f.last_accessed,
            f.last_modified,
            f.access_count,
            data.index_values.first().cloned().flatten(),
            data.index_values.get(1).cloned().flatten(),
            data.partition,
        ],
    )?;
    Ok(())
}

fn read_row(table: &str, row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(VersionedRow {
        table: table.to_string(),
        id: row.get(0)?,
        data: row.get(1)?,
        version: row.get::<_, i64>(2)?.max(0) as u64,
        is_dirty: row.get(3)?,
        sync_status: RowSyncStatus::parse(&row.get::<_, String>(4)?),
        last_synced_at: from_millis(row.get(5)?),
        last_accessed_at: from_millis(row.get(6)?),
        last_modified_at: from_millis(row.get(7)?),
        access_count: row.get::<_, i64>(8)?.max(0) as u64,
    })
}

fn select_row(conn: &Connection, table: &str, id: &str) -> Result<Option<RawRow>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM rows WHERE table_name = ?1 AND id = ?2", ROW_COLUMNS),
            params![table, id],
            |row| read_row(table, row),
        )
        .optional()?;
    Ok(row)
}

fn select_rows(conn: &Connection, table: &str, sql: &str, args: impl rusqlite::Params) -> Result<Vec<RawRow>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(args, |row| read_row(table, row))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Drop expired rows from `rows`, deleting them from the store as well.
fn retain_live(
    tx: &Transaction<'_>,
    table: &str,
    rows: Vec<RawRow>,
    policy: ExpirationPolicy,
    now: DateTime<Utc>,
) -> Result<Vec<RawRow>> {
    let mut live = Vec::with_capacity(rows.len());
    let mut expired = 0;
    for row in rows {
        if policy.is_expired(row.is_dirty, row.last_synced_at, now) {
            delete_row(tx, table, &row.id)?;
            expired += 1;
        } else {
            live.push(row);
        }
    }
    if expired > 0 {
        debug!(table, expired, "Purged expired rows during scan");
    }
    Ok(live)
}

fn delete_row(conn: &Connection, table: &str, id: &str) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM rows WHERE table_name = ?1 AND id = ?2",
        params![table, id],
    )?;
    Ok(removed)
}

fn count_pending(conn: &Connection, table: &str) -> Result<u64> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pending_mutations WHERE table_name = ?1",
        params![table],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

fn decode<T: DeserializeOwned>(row: RawRow) -> Result<VersionedRow<T>> {
    let data = serde_json::from_str(&row.data)?;
    Ok(row.map(|_| data))
}

/// Rows whose `field` is exactly `value`, decoded into `T`.
fn matching<T: DeserializeOwned>(
    rows: Vec<VersionedRow<Value>>,
    field: &str,
    value: &Value,
) -> Result<Vec<VersionedRow<T>>> {
    rows.into_iter()
        .filter(|row| row.data.get(field) == Some(value))
        .map(|row| {
            let data = serde_json::from_value(row.data.clone())?;
            Ok(row.map(|_| data))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Entry {
        #[serde(rename = "classId")]
        class_id: String,
        handler: String,
        #[serde(rename = "licenseKey")]
        license_key: String,
    }

    fn entry(class_id: &str, handler: &str, license_key: &str) -> Entry {
        Entry {
            class_id: class_id.to_string(),
            handler: handler.to_string(),
            license_key: license_key.to_string(),
        }
    }

    fn store() -> RowStore {
        RowStore::new(Database::open_in_memory(Duration::from_secs(2)).unwrap())
    }

    fn online(ttl_ms: u64) -> ExpirationPolicy {
        ExpirationPolicy::new(Duration::from_millis(ttl_ms), true)
    }

    #[tokio::test]
    async fn test_version_starts_at_one_and_increases() {
        let store = store();
        let v1 = store
            .set("entries", "e1", &entry("c1", "Ann", "k"), WriteOptions::local(false))
            .await
            .unwrap();
        let v2 = store
            .set("entries", "e1", &entry("c1", "Bob", "k"), WriteOptions::local(false))
            .await
            .unwrap();
        assert_eq!((v1, v2), (1, 2));

        let row: VersionedRow<Entry> = store.peek("entries", "e1").await.unwrap().unwrap();
        assert_eq!(row.version, 2);
        assert_eq!(row.data.handler, "Bob");
    }

    #[tokio::test]
    async fn test_stale_expected_version_writes_nothing() {
        let store = store();
        store
            .set("entries", "e1", &entry("c1", "Ann", "k"), WriteOptions::local(false))
            .await
            .unwrap();
        store
            .set("entries", "e1", &entry("c1", "Bob", "k"), WriteOptions::local(false))
            .await
            .unwrap();

        let err = store
            .set(
                "entries",
                "e1",
                &entry("c1", "Cat", "k"),
                WriteOptions::local(true).expecting(1),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ReplicaError::ConcurrentModification {
                table: "entries".to_string(),
                id: "e1".to_string(),
                expected: 1,
                found: 2,
            }
        );

        let row: VersionedRow<Entry> = store.peek("entries", "e1").await.unwrap().unwrap();
        assert_eq!(row.version, 2);
        assert_eq!(row.data.handler, "Bob");
        assert!(!row.is_dirty);
    }

    #[tokio::test]
    async fn test_expect_absent_rejects_existing_row() {
        let store = store();
        store
            .set("entries", "e1", &entry("c1", "Ann", "k"), WriteOptions::local(false).expecting(0))
            .await
            .unwrap();
        let err = store
            .set("entries", "e1", &entry("c1", "Ann", "k"), WriteOptions::local(false).expecting(0))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_get_refreshes_access_but_not_version() {
        let store = store();
        store
            .set("entries", "e1", &entry("c1", "Ann", "k"), WriteOptions::local(false))
            .await
            .unwrap();

        for _ in 0..3 {
            store.get::<Entry>("entries", "e1", online(60_000)).await.unwrap();
        }
        let row: VersionedRow<Entry> = store.peek("entries", "e1").await.unwrap().unwrap();
        assert_eq!(row.access_count, 3);
        assert_eq!(row.version, 1);
    }

    #[tokio::test]
    async fn test_expired_row_is_deleted_on_get_but_dirty_row_survives() {
        let store = store();
        store
            .set("entries", "clean", &entry("c1", "Ann", "k"), WriteOptions::local(false))
            .await
            .unwrap();
        store
            .set("entries", "dirty", &entry("c1", "Bob", "k"), WriteOptions::local(true))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let policy = online(10);
        assert!(store.get::<Entry>("entries", "clean", policy).await.unwrap().is_none());
        assert!(store.peek::<Entry>("entries", "clean").await.unwrap().is_none());
        assert!(store.get::<Entry>("entries", "dirty", policy).await.unwrap().is_some());

        let offline = ExpirationPolicy::new(Duration::from_millis(10), false);
        store
            .set("entries", "clean", &entry("c1", "Ann", "k"), WriteOptions::local(false))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.get::<Entry>("entries", "clean", offline).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_scan_filters_by_partition() {
        let store = store();
        let items = vec![
            ("e1".to_string(), entry("c1", "Ann", "club-a")),
            ("e2".to_string(), entry("c1", "Bob", "club-b")),
            ("e3".to_string(), entry("c2", "Cat", "club-a")),
        ];
        store.batch_set("entries", &items, false).await.unwrap();

        let all: Vec<VersionedRow<Entry>> = store.scan("entries", None, online(60_000)).await.unwrap();
        assert_eq!(all.len(), 3);

        let club_a: Vec<VersionedRow<Entry>> =
            store.scan("entries", Some("club-a"), online(60_000)).await.unwrap();
        let ids: Vec<_> = club_a.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e3"]);
        assert!(club_a.iter().all(|r| r.table == "entries"));
    }

    #[tokio::test]
    async fn test_query_by_index_uses_index_or_scans() {
        let store = store();
        let items = vec![
            ("e1".to_string(), entry("c1", "Ann", "k")),
            ("e2".to_string(), entry("c2", "Bob", "k")),
            ("e3".to_string(), entry("c1", "Bob", "k")),
        ];
        store.batch_set("entries", &items, false).await.unwrap();

        let by_class: Vec<VersionedRow<Entry>> = store
            .query_by_index("entries", "classId", &json!("c1"), online(60_000))
            .await
            .unwrap();
        assert_eq!(by_class.len(), 2);

        let by_handler: Vec<VersionedRow<Entry>> = store
            .query_by_index("entries", "handler", &json!("Bob"), online(60_000))
            .await
            .unwrap();
        let ids: Vec<_> = by_handler.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["e2", "e3"]);
    }

    #[tokio::test]
    async fn test_index_and_scan_queries_agree_on_exact_values() {
        let store = store();
        let items = vec![
            ("e1".to_string(), json!({"classId": 42, "handler": 42})),
            ("e2".to_string(), json!({"classId": "42", "handler": "42"})),
            ("e3".to_string(), json!({"classId": null, "handler": null})),
        ];
        store.batch_set("entries", &items, false).await.unwrap();

        for field in ["classId", "handler"] {
            let ids = |rows: Vec<VersionedRow<Value>>| -> Vec<String> {
                rows.into_iter().map(|r| r.id).collect()
            };
            let number = store
                .query_by_index("entries", field, &json!(42), online(60_000))
                .await
                .unwrap();
            assert_eq!(ids(number), vec!["e1"], "{}", field);

            let text = store
                .query_by_index("entries", field, &json!("42"), online(60_000))
                .await
                .unwrap();
            assert_eq!(ids(text), vec!["e2"], "{}", field);

            let null = store
                .query_by_index("entries", field, &Value::Null, online(60_000))
                .await
                .unwrap();
            assert_eq!(ids(null), vec!["e3"], "{}", field);
        }
    }

    #[tokio::test]
    async fn test_batch_set_resets_version() {
        let store = store();
        for _ in 0..3 {
            store
                .set("entries", "e1", &entry("c1", "Ann", "k"), WriteOptions::local(false))
                .await
                .unwrap();
        }
        store
            .batch_set("entries", &[("e1".to_string(), entry("c1", "Zed", "k"))], false)
            .await
            .unwrap();
        let row: VersionedRow<Entry> = store.peek("entries", "e1").await.unwrap().unwrap();
        assert_eq!(row.version, 1);
        assert_eq!(row.data.handler, "Zed");
    }

    #[tokio::test]
    async fn test_delete_missing_row_is_noop() {
        let store = store();
        assert!(!store.delete("entries", "ghost").await.unwrap());
        store
            .set("entries", "e1", &entry("c1", "Ann", "k"), WriteOptions::local(false))
            .await
            .unwrap();
        assert!(store.delete("entries", "e1").await.unwrap());
        assert!(!store.delete("entries", "e1").await.unwrap());
        assert_eq!(
            store
                .delete_many("entries", vec!["e1".to_string(), "e2".to_string()])
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_clean_expired_spares_dirty_and_offline() {
        let store = store();
        store
            .set("entries", "clean", &entry("c1", "Ann", "k"), WriteOptions::local(false))
            .await
            .unwrap();
        store
            .set("entries", "dirty", &entry("c1", "Bob", "k"), WriteOptions::local(true))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let offline = ExpirationPolicy::new(Duration::from_millis(10), false);
        assert_eq!(store.clean_expired("entries", offline).await.unwrap(), 0);
        assert_eq!(store.clean_expired("entries", online(10)).await.unwrap(), 1);
        assert_eq!(store.count("entries").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mark_synced_requires_unchanged_version() {
        let store = store();
        store
            .set("entries", "e1", &entry("c1", "Ann", "k"), WriteOptions::local(true))
            .await
            .unwrap();
        store
            .set("entries", "e1", &entry("c1", "Ann2", "k"), WriteOptions::local(true))
            .await
            .unwrap();

        assert!(!store.mark_synced("entries", "e1", 1).await.unwrap());
        assert!(store.mark_synced("entries", "e1", 2).await.unwrap());

        let row: VersionedRow<Entry> = store.peek("entries", "e1").await.unwrap().unwrap();
        assert!(!row.is_dirty);
        assert_eq!(row.sync_status, RowSyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_metadata_round_trip() {
        let store = store();
        assert!(store.load_metadata("trials").await.unwrap().is_none());

        let meta = SyncMetadata {
            last_incremental_sync_at: Some(from_millis(1_700_000_000_000)),
            sync_status: SyncStatus::Error,
            conflict_count: 4,
            error_message: Some("offline".to_string()),
            ..SyncMetadata::new("trials")
        };
        store.save_metadata(&meta).await.unwrap();
        assert_eq!(store.load_metadata("trials").await.unwrap(), Some(meta));
        assert_eq!(store.tables().await.unwrap(), vec!["trials".to_string()]);
    }

    #[tokio::test]
    async fn test_mutation_lifecycle() {
        let store = store();
        let mutation = PendingMutation::new("entries", "e1");
        store.enqueue_mutation(&mutation).await.unwrap();
        assert_eq!(store.pending_count("entries").await.unwrap(), 1);

        store
            .update_mutation(&mutation.mutation_id, MutationStatus::Sending, None)
            .await
            .unwrap();
        store
            .update_mutation(
                &mutation.mutation_id,
                MutationStatus::Failed,
                Some("timeout".to_string()),
            )
            .await
            .unwrap();

        let failed = store
            .list_mutations(Some("entries"), &[MutationStatus::Failed])
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("timeout"));
        assert!(store
            .list_mutations(None, &[MutationStatus::Queued])
            .await
            .unwrap()
            .is_empty());

        store.remove_mutation(&mutation.mutation_id).await.unwrap();
        assert_eq!(store.pending_count("entries").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stats_counts_dirty_rows_and_bytes() {
        let store = store();
        store
            .set("entries", "e1", &entry("c1", "Ann", "k"), WriteOptions::local(true))
            .await
            .unwrap();
        store
            .set("entries", "e2", &entry("c1", "Bob", "k"), WriteOptions::local(false))
            .await
            .unwrap();

        let stats = store.stats("entries").await.unwrap();
        assert_eq!(stats.row_count, 2);
        assert_eq!(stats.dirty_count, 1);
        assert!(stats.estimated_bytes > 2 * ENVELOPE_OVERHEAD_BYTES);

        let footprints = store.footprints("entries").await.unwrap();
        let total: u64 = footprints.iter().map(|f| f.bytes).sum();
        assert_eq!(total, stats.estimated_bytes);
    }
}
