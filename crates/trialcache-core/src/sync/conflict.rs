//! Conflict resolution between a cached row and its incoming remote copy.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::store::VersionedRow;

pub trait ConflictResolver<T>: Send + Sync {
    /// Produce the row to store given the local envelope and the remote value.
    fn resolve(&self, local: &VersionedRow<T>, remote: T) -> T;
}

/// The remote copy always wins. For reference tables with no local edits.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerAuthoritative;

impl<T> ConflictResolver<T> for ServerAuthoritative {
    fn resolve(&self, _local: &VersionedRow<T>, remote: T) -> T {
        remote
    }
}

/// Remote wins except for a declared set of locally owned top-level fields,
/// which are carried over from the local copy.
#[derive(Debug, Clone, Default)]
pub struct FieldAuthorityMerge {
    local_fields: Vec<String>,
}

impl FieldAuthorityMerge {
    pub fn new<I, S>(local_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            local_fields: local_fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn local_fields(&self) -> &[String] {
        &self.local_fields
    }

    /// Overlay the locally owned fields of `local` onto `remote`. A field
    /// missing locally keeps the remote value.
    pub fn merge_values(&self, local: &Value, mut remote: Value) -> Value {
        let (Some(local), Some(target)) = (local.as_object(), remote.as_object_mut()) else {
            return remote;
        };
        for field in &self.local_fields {
            if let Some(value) = local.get(field) {
                target.insert(field.clone(), value.clone());
            }
        }
        remote
    }
}

impl<T> ConflictResolver<T> for FieldAuthorityMerge
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn resolve(&self, local: &VersionedRow<T>, remote: T) -> T {
        match self.merge_typed(&local.data, &remote) {
            Ok(merged) => merged,
            Err(e) => {
                warn!(table = %local.table, id = %local.id, error = %e, "Merge failed, taking remote");
                remote
            }
        }
    }
}

impl FieldAuthorityMerge {
    fn merge_typed<T: Serialize + DeserializeOwned>(&self, local: &T, remote: &T) -> serde_json::Result<T> {
        let local = serde_json::to_value(local)?;
        let remote = serde_json::to_value(remote)?;
        serde_json::from_value(self.merge_values(&local, remote))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RowSyncStatus;
    use chrono::Utc;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Settings {
        #[serde(rename = "ringNumber")]
        ring_number: u32,
        #[serde(rename = "displayName")]
        display_name: String,
        #[serde(rename = "soundEnabled")]
        sound_enabled: bool,
    }

    fn local_row(data: Settings) -> VersionedRow<Settings> {
        let now = Utc::now();
        VersionedRow {
            table: "settings".to_string(),
            id: "s1".to_string(),
            data,
            version: 3,
            is_dirty: true,
            sync_status: RowSyncStatus::Pending,
            last_synced_at: now,
            last_accessed_at: now,
            last_modified_at: now,
            access_count: 0,
        }
    }

    #[test]
    fn test_server_authoritative_takes_remote() {
        let local = local_row(Settings {
            ring_number: 1,
            display_name: "local".into(),
            sound_enabled: false,
        });
        let remote = Settings {
            ring_number: 2,
            display_name: "remote".into(),
            sound_enabled: true,
        };
        assert_eq!(ServerAuthoritative.resolve(&local, remote.clone()), remote);
    }

    #[test]
    fn test_field_authority_keeps_local_fields() {
        let resolver = FieldAuthorityMerge::new(["soundEnabled", "ringNumber"]);
        let local = local_row(Settings {
            ring_number: 4,
            display_name: "local".into(),
            sound_enabled: false,
        });
        let remote = Settings {
            ring_number: 2,
            display_name: "remote".into(),
            sound_enabled: true,
        };
        let merged = resolver.resolve(&local, remote);
        assert_eq!(
            merged,
            Settings {
                ring_number: 4,
                display_name: "remote".into(),
                sound_enabled: false,
            }
        );
    }

    #[test]
    fn test_merge_values_ignores_absent_local_field() {
        let resolver = FieldAuthorityMerge::new(["note"]);
        let merged = resolver.merge_values(&json!({"a": 1}), json!({"a": 2, "note": "remote"}));
        assert_eq!(merged, json!({"a": 2, "note": "remote"}));
    }

    #[test]
    fn test_merge_values_non_object_takes_remote() {
        let resolver = FieldAuthorityMerge::new(["a"]);
        assert_eq!(resolver.merge_values(&json!(1), json!(2)), json!(2));
    }
}
