//! Physical schema and its idempotent upgrade routine.
//!
//! The schema version lives in `schema_meta`. Every step only creates what is
//! missing, so running `upgrade` against an already current store is a no-op.

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{ReplicaError, Result};

/// Current physical schema version.
pub const SCHEMA_VERSION: i64 = 2;

/// A payload field backed by a secondary index column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexedField {
    pub field: &'static str,
    pub column: &'static str,
}

/// Foreign-key-like fields with a dedicated column and index.
/// Queries on any other field fall back to a full table scan.
pub const INDEXED_FIELDS: &[IndexedField] = &[
    IndexedField {
        field: "trialId",
        column: "trial_id",
    },
    IndexedField {
        field: "classId",
        column: "class_id",
    },
];

/// Payload field used for tenant isolation in `get_all`.
pub const PARTITION_FIELD: &str = "licenseKey";

const SCHEMA_V1: &str = "
    CREATE TABLE IF NOT EXISTS rows (
        table_name TEXT NOT NULL,
        id TEXT NOT NULL,
        data TEXT NOT NULL,
        version INTEGER NOT NULL,
        is_dirty INTEGER NOT NULL DEFAULT 0,
        sync_status TEXT NOT NULL DEFAULT 'synced',
        last_synced_at INTEGER NOT NULL,
        last_accessed_at INTEGER NOT NULL,
        last_modified_at INTEGER NOT NULL,
        access_count INTEGER NOT NULL DEFAULT 0,
        trial_id TEXT,
        class_id TEXT,
        PRIMARY KEY (table_name, id)
    );
    CREATE INDEX IF NOT EXISTS idx_rows_trial_id ON rows (table_name, trial_id);
    CREATE INDEX IF NOT EXISTS idx_rows_class_id ON rows (table_name, class_id);
    CREATE INDEX IF NOT EXISTS idx_rows_dirty ON rows (table_name, is_dirty);
    CREATE TABLE IF NOT EXISTS sync_metadata (
        table_name TEXT PRIMARY KEY,
        last_full_sync_at INTEGER,
        last_incremental_sync_at INTEGER,
        sync_status TEXT NOT NULL,
        conflict_count INTEGER NOT NULL DEFAULT 0,
        pending_mutation_count INTEGER NOT NULL DEFAULT 0,
        error_message TEXT
    );
";

const SCHEMA_V2: &str = "
    CREATE INDEX IF NOT EXISTS idx_rows_partition ON rows (table_name, partition_key);
    CREATE TABLE IF NOT EXISTS pending_mutations (
        mutation_id TEXT PRIMARY KEY,
        table_name TEXT NOT NULL,
        row_id TEXT NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_pending_status ON pending_mutations (status);
    CREATE INDEX IF NOT EXISTS idx_pending_table ON pending_mutations (table_name, status);
";

/// Bring the store up to `SCHEMA_VERSION` inside a single transaction.
pub fn upgrade(connection: &mut Connection) -> Result<()> {
    let tx = connection.transaction()?;
    tx.execute_batch("CREATE TABLE IF NOT EXISTS schema_meta (version INTEGER NOT NULL);")?;

    let found: Option<i64> = tx
        .query_row("SELECT version FROM schema_meta LIMIT 1", [], |row| row.get(0))
        .optional()?;
    let from = found.unwrap_or(0);

    if from > SCHEMA_VERSION {
        return Err(ReplicaError::Database(format!(
            "unsupported schema version: {}",
            from
        )));
    }
    if from == SCHEMA_VERSION {
        debug!(version = from, "Schema already current");
        return Ok(());
    }

    if from < 1 {
        tx.execute_batch(SCHEMA_V1)?;
    }
    if from < 2 {
        if !column_exists(&tx, "rows", "partition_key")? {
            tx.execute_batch("ALTER TABLE rows ADD COLUMN partition_key TEXT;")?;
        }
        tx.execute_batch(SCHEMA_V2)?;
    }

    match found {
        None => tx.execute(
            "INSERT INTO schema_meta (version) VALUES (?1)",
            params![SCHEMA_VERSION],
        )?,
        Some(_) => tx.execute("UPDATE schema_meta SET version = ?1", params![SCHEMA_VERSION])?,
    };
    tx.commit()?;

    info!(from, to = SCHEMA_VERSION, "Schema upgraded");
    Ok(())
}

/// Version recorded in `schema_meta`, if any.
pub fn current_version(connection: &Connection) -> Result<Option<i64>> {
    let has_meta: bool = connection.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_meta')",
        [],
        |row| row.get(0),
    )?;
    if !has_meta {
        return Ok(None);
    }
    let version = connection
        .query_row("SELECT version FROM schema_meta LIMIT 1", [], |row| row.get(0))
        .optional()?;
    Ok(version)
}

fn column_exists(tx: &Transaction<'_>, table: &str, column: &str) -> Result<bool> {
    let exists: bool = tx.query_row(
        "SELECT EXISTS(SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2)",
        params![table, column],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Index column backing `field`, if it is one of the declared fields.
pub fn index_column(field: &str) -> Option<&'static str> {
    INDEXED_FIELDS
        .iter()
        .find(|f| f.field == field)
        .map(|f| f.column)
}

/// Normalized text form of a payload field, as stored in index columns.
pub fn index_value(data: &Value, field: &str) -> Option<String> {
    match data.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Normalized text form of a query value, matching `index_value`.
pub fn query_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
