use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: String,
    #[serde(rename = "licenseKey")]
    pub license_key: String,
    pub name: String,
    #[serde(rename = "startDate")]
    pub start_date: Option<String>,
    #[serde(rename = "endDate")]
    pub end_date: Option<String>,
    pub location: Option<String>,
}

impl Trial {
    pub fn new(id: impl Into<String>, license_key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            license_key: license_key.into(),
            name: name.into(),
            start_date: None,
            end_date: None,
            location: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialClass {
    pub id: String,
    #[serde(rename = "trialId")]
    pub trial_id: String,
    #[serde(rename = "licenseKey")]
    pub license_key: String,
    pub name: String,
    pub level: Option<String>,
    /// Course time in seconds.
    #[serde(rename = "courseTime", default)]
    pub course_time: Option<f64>,
}

impl TrialClass {
    pub fn new(
        id: impl Into<String>,
        trial_id: impl Into<String>,
        license_key: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            trial_id: trial_id.into(),
            license_key: license_key.into(),
            name: name.into(),
            level: None,
            course_time: None,
        }
    }
}
