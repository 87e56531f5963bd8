//! The remote data source a table syncs against.
//!
//! Transport is not this crate's concern: an implementation only has to
//! answer "rows changed since T" and accept a per-row upsert.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One row as the remote source sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRow {
    pub id: String,
    pub data: Value,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl RemoteRow {
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            data,
            updated_at: None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Not authorized")]
    Unauthorized,

    #[error("Row {id} rejected: {reason}")]
    Rejected { id: String, reason: String },

    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Rows of `table` changed at or after `since`, scoped to `tenant_key`.
    async fn fetch_changed(
        &self,
        table: &str,
        since: DateTime<Utc>,
        tenant_key: &str,
    ) -> Result<Vec<RemoteRow>, RemoteError>;

    /// Upsert one row remotely.
    async fn push_row(&self, table: &str, row: RemoteRow) -> Result<(), RemoteError>;
}
