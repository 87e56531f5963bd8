use serde::{Deserialize, Serialize};

/// Scoring configuration for one trial. The server owns the rules; the device
/// owns how the scoring screen behaves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringSettings {
    pub id: String,
    #[serde(rename = "trialId")]
    pub trial_id: String,
    #[serde(rename = "licenseKey")]
    pub license_key: String,
    #[serde(rename = "faultLimit")]
    pub fault_limit: u32,
    #[serde(rename = "timeFaultsPerSecond")]
    pub time_faults_per_second: f64,
    #[serde(rename = "soundEnabled", default)]
    pub sound_enabled: bool,
    #[serde(rename = "largeTimer", default)]
    pub large_timer: bool,
}

impl ScoringSettings {
    /// Fields preserved from the local copy when merging a server update.
    pub const LOCAL_FIELDS: [&'static str; 2] = ["soundEnabled", "largeTimer"];

    pub fn new(id: impl Into<String>, trial_id: impl Into<String>, license_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            trial_id: trial_id.into(),
            license_key: license_key.into(),
            fault_limit: 20,
            time_faults_per_second: 1.0,
            sound_enabled: true,
            large_timer: false,
        }
    }
}
