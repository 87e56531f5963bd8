use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    #[default]
    Pending,
    InRing,
    Scored,
    Scratched,
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryStatus::Pending => write!(f, "Pending"),
            EntryStatus::InRing => write!(f, "In Ring"),
            EntryStatus::Scored => write!(f, "Scored"),
            EntryStatus::Scratched => write!(f, "Scratched"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    #[serde(rename = "classId")]
    pub class_id: String,
    #[serde(rename = "trialId")]
    pub trial_id: String,
    #[serde(rename = "licenseKey")]
    pub license_key: String,
    pub armband: u32,
    #[serde(rename = "handlerName")]
    pub handler_name: String,
    #[serde(default)]
    pub status: EntryStatus,
    #[serde(default)]
    pub faults: u32,
    /// Run time in seconds.
    #[serde(default)]
    pub time: Option<f64>,
}

impl Entry {
    pub fn new(
        id: impl Into<String>,
        class_id: impl Into<String>,
        trial_id: impl Into<String>,
        license_key: impl Into<String>,
        armband: u32,
        handler_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            class_id: class_id.into(),
            trial_id: trial_id.into(),
            license_key: license_key.into(),
            armband,
            handler_name: handler_name.into(),
            status: EntryStatus::Pending,
            faults: 0,
            time: None,
        }
    }

    /// Record a scored run.
    pub fn score(mut self, faults: u32, time: f64) -> Self {
        self.status = EntryStatus::Scored;
        self.faults = faults;
        self.time = Some(time);
        self
    }

    pub fn is_scored(&self) -> bool {
        self.status == EntryStatus::Scored
    }
}
