use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Table-level sync state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Error,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "syncing" => SyncStatus::Syncing,
            "error" => SyncStatus::Error,
            _ => SyncStatus::Idle,
        }
    }
}

/// One record per table, created lazily on the first metadata write and
/// updated after every sync attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct SyncMetadata {
    pub table: String,
    #[cfg_attr(feature = "ts", ts(type = "string | null"))]
    pub last_full_sync_at: Option<DateTime<Utc>>,
    #[cfg_attr(feature = "ts", ts(type = "string | null"))]
    pub last_incremental_sync_at: Option<DateTime<Utc>>,
    pub sync_status: SyncStatus,
    pub conflict_count: u64,
    pub pending_mutation_count: u64,
    pub error_message: Option<String>,
}

impl SyncMetadata {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }

    /// Most recent sync of either kind.
    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        match (self.last_full_sync_at, self.last_incremental_sync_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn age_minutes(&self) -> Option<i64> {
        self.last_synced_at()
            .map(|at| (Utc::now() - at).num_minutes())
    }

    /// Human-readable age of the last sync, "never" if the table has not synced.
    pub fn age_display(&self) -> String {
        match self.age_minutes() {
            Some(minutes) => format_age(minutes),
            None => "never".to_string(),
        }
    }
}

fn format_age(minutes: i64) -> String {
    if minutes < 1 {
        // Clock skew lands here too
        "just now".to_string()
    } else if minutes < 60 {
        format!("{}m ago", minutes)
    } else if minutes < 1440 {
        let hours = minutes / 60;
        if minutes % 60 >= 30 {
            format!("{}h ago", hours + 1)
        } else {
            format!("{}h ago", hours)
        }
    } else {
        let days = minutes / 1440;
        if (minutes % 1440) / 60 >= 12 {
            format!("{}d ago", days + 1)
        } else {
            format!("{}d ago", days)
        }
    }
}
