//! Payload types cached by the replica.
//!
//! - `Trial`, `TrialClass`: reference data owned by the server
//! - `Entry`: per-run records, edited on device while scoring
//! - `ScoringSettings`: server defaults with device-owned fields layered on top
//!
//! Every payload carries `licenseKey`, the tenant partition, and child rows
//! carry `trialId`/`classId`, the indexed parent links.

pub mod entry;
pub mod settings;
pub mod trial;

pub use entry::{Entry, EntryStatus};
pub use settings::ScoringSettings;
pub use trial::{Trial, TrialClass};

/// Table names used by the bundled models.
pub mod tables {
    pub const TRIALS: &str = "trials";
    pub const CLASSES: &str = "classes";
    pub const ENTRIES: &str = "entries";
    pub const SCORING_SETTINGS: &str = "scoring_settings";

    pub const ALL: [&str; 4] = [TRIALS, CLASSES, ENTRIES, SCORING_SETTINGS];
}
