//! Persistent row storage for the local replica.
//!
//! This module provides the pieces every table is built on:
//! - `Database`: the one shared physical connection, with per-operation deadlines
//! - `schema`: the versioned physical layout and its idempotent upgrade
//! - `RowStore`: keyed get/set/delete/scan by table name and row id
//! - `VersionedRow`: the envelope (version, dirty flag, timestamps, access count)
//!   wrapped around every cached record
//!
//! Three logical partitions live in the database: row data keyed by
//! (table, id), sync metadata keyed by table, and pending mutations keyed by
//! mutation id.

pub mod database;
pub mod metadata;
pub mod mutations;
pub mod row;
pub mod rows;
pub mod schema;

pub use database::{Database, SqliteOpener, StoreOpener};
pub use metadata::{SyncMetadata, SyncStatus};
pub use mutations::{MutationStatus, PendingMutation};
pub use row::{RowFootprint, RowSyncStatus, VersionedRow};
pub use rows::{RowStore, TableStats, WriteOptions, WriteOrigin};
