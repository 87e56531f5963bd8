use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors surfaced by the replica engine.
///
/// `Clone` so that a single bootstrap outcome can be handed to every table
/// waiting on the same open.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicaError {
    #[error("Row not found: {table}/{id}")]
    NotFound { table: String, id: String },

    #[error("Concurrent modification of {table}/{id}: expected version {expected}, found {found}")]
    ConcurrentModification {
        table: String,
        id: String,
        expected: u64,
        found: u64,
    },

    #[error("Operation timed out after {timeout_ms}ms: {operation}")]
    OperationTimeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("Local store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Local store corrupted: {0}")]
    StoreCorrupted(String),

    #[error("Sync failed: {0}")]
    SyncFailed(String),

    #[error("No secondary index on {table}.{field}")]
    IndexMissing { table: String, field: String },

    #[error("Update of {table}/{id} failed after {retries} retries")]
    UpdateFailed {
        table: String,
        id: String,
        retries: u32,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database error: {0}")]
    Database(String),
}

pub type Result<T> = std::result::Result<T, ReplicaError>;

impl ReplicaError {
    /// Errors a caller should treat as a transient miss rather than a failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReplicaError::OperationTimeout { .. } | ReplicaError::StoreUnavailable(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ReplicaError::ConcurrentModification { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ReplicaError::NotFound { .. })
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, ReplicaError::StoreCorrupted(_))
    }
}

impl From<rusqlite::Error> for ReplicaError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => {
                ReplicaError::StoreCorrupted(err.to_string())
            }
            _ => ReplicaError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ReplicaError {
    fn from(err: serde_json::Error) -> Self {
        ReplicaError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for ReplicaError {
    fn from(err: std::io::Error) -> Self {
        ReplicaError::Database(format!("io: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrupt_codes_map_to_store_corrupted() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_NOTADB),
            Some("file is not a database".to_string()),
        );
        assert!(ReplicaError::from(err).is_corruption());

        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(matches!(ReplicaError::from(err), ReplicaError::Database(_)));
    }

    #[test]
    fn test_transient_classification() {
        let timeout = ReplicaError::OperationTimeout {
            operation: "get",
            timeout_ms: 10,
        };
        assert!(timeout.is_transient());
        assert!(!timeout.is_conflict());

        let conflict = ReplicaError::ConcurrentModification {
            table: "entries".to_string(),
            id: "e1".to_string(),
            expected: 1,
            found: 2,
        };
        assert!(conflict.is_conflict());
        assert!(!conflict.is_transient());
        assert_eq!(
            conflict.to_string(),
            "Concurrent modification of entries/e1: expected version 1, found 2"
        );
    }
}
