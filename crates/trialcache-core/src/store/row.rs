use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Sync state of a single cached row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum RowSyncStatus {
    Pending,
    #[default]
    Synced,
    Error,
}

impl RowSyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RowSyncStatus::Pending => "pending",
            RowSyncStatus::Synced => "synced",
            RowSyncStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => RowSyncStatus::Pending,
            "error" => RowSyncStatus::Error,
            _ => RowSyncStatus::Synced,
        }
    }
}

/// Envelope wrapping every cached record.
///
/// Only the owning table mutates the envelope fields; callers see them
/// read-only through `ReplicaTable::try_get`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionedRow<T> {
    pub table: String,
    pub id: String,
    pub data: T,
    /// Starts at 1 and strictly increases with every write to the same key.
    pub version: u64,
    pub is_dirty: bool,
    pub sync_status: RowSyncStatus,
    pub last_synced_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
    pub access_count: u64,
}

impl<T> VersionedRow<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> VersionedRow<U> {
        VersionedRow {
            table: self.table,
            id: self.id,
            data: f(self.data),
            version: self.version,
            is_dirty: self.is_dirty,
            sync_status: self.sync_status,
            last_synced_at: self.last_synced_at,
            last_accessed_at: self.last_accessed_at,
            last_modified_at: self.last_modified_at,
            access_count: self.access_count,
        }
    }
}

/// Size and ranking inputs for one row, without its payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RowFootprint {
    pub id: String,
    pub bytes: u64,
    pub is_dirty: bool,
    pub last_accessed_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
    pub access_count: u64,
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
