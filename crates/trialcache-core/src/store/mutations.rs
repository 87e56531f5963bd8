use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    Queued,
    Sending,
    Failed,
}

impl MutationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MutationStatus::Queued => "queued",
            MutationStatus::Sending => "sending",
            MutationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "sending" => MutationStatus::Sending,
            "failed" => MutationStatus::Failed,
            _ => MutationStatus::Queued,
        }
    }
}

/// A local write waiting for remote confirmation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingMutation {
    pub mutation_id: String,
    pub table: String,
    pub row_id: String,
    pub status: MutationStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PendingMutation {
    pub fn new(table: impl Into<String>, row_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            mutation_id: Uuid::new_v4().to_string(),
            table: table.into(),
            row_id: row_id.into(),
            status: MutationStatus::Queued,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}
