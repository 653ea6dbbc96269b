//! Raw configuration schema (as parsed from TOML)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Raw configuration as parsed from TOML
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawConfig {
    /// Config schema version
    pub config_version: u32,

    /// Service paths
    #[serde(default)]
    pub service: RawServiceConfig,

    /// Reconciliation tunables
    #[serde(default)]
    pub engine: RawEngineConfig,

    /// Subject catalog with schedules and rosters
    #[serde(default)]
    pub subjects: Vec<RawSubject>,
}

/// Service-level settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawServiceConfig {
    /// IPC socket path
    pub socket_path: Option<PathBuf>,

    /// Log directory
    pub log_dir: Option<PathBuf>,

    /// Data directory for store
    pub data_dir: Option<PathBuf>,
}

/// Engine tunables. Anything omitted takes its default.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawEngineConfig {
    /// Fraction of the scheduled duration after which a join is tardy
    pub tardy_fraction: Option<f64>,
    pub sync_tolerance_before_ms: Option<u64>,
    pub sync_tolerance_after_ms: Option<u64>,
    /// Minutes after the scheduled end before a session finalizes by timeout
    pub finalize_timeout_minutes: Option<u64>,
    pub token_lead_minutes: Option<u64>,
    pub token_grace_minutes: Option<u64>,
    pub unmatched_log_capacity: Option<usize>,
    /// Reject submissions without a verification token
    pub require_token: Option<bool>,
    pub live_cache_ttl_seconds: Option<u64>,
    pub live_cache_max_entries: Option<usize>,
    pub finalized_republish_delay_ms: Option<u64>,
    pub tick_interval_seconds: Option<u64>,
}

/// Raw subject (course) definition
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawSubject {
    /// Unique stable ID
    pub id: String,

    /// Display name
    pub name: String,

    /// Standing meeting code for this subject
    pub meet_code: Option<String>,

    /// Weekly class slots
    #[serde(default)]
    pub schedule: Vec<RawTimeWindow>,

    /// Last day of the add/drop period (YYYY-MM-DD), inclusive
    pub add_drop_until: Option<String>,

    pub instructor: Option<RawInstructor>,

    #[serde(default)]
    pub roster: Vec<RawMember>,
}

/// Time window
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawTimeWindow {
    /// Days of week: "weekdays", "weekends", "all", or list like ["mon", "tue", "wed"]
    pub days: RawDays,

    /// Start time (HH:MM format)
    pub start: String,

    /// End time (HH:MM format)
    pub end: String,
}

/// Days specification
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum RawDays {
    Preset(String),
    List(Vec<String>),
}

/// Designated instructor of a subject
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawInstructor {
    pub user_id: Option<String>,
    pub name: String,
    pub email: Option<String>,
    pub staff_id: Option<String>,
}

/// Enrolled student
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawMember {
    pub user_id: String,
    pub name: String,
    pub email: Option<String>,
    #[serde(default)]
    pub email_verified: bool,
    pub student_id: Option<String>,
    #[serde(default)]
    pub student_id_verified: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_subject_with_roster() {
        let toml_str = r#"
            config_version = 1

            [[subjects]]
            id = "math-101"
            name = "Calculus I"
            meet_code = "abc-defg-hij"
            instructor = { name = "Alan Turing", email = "turing@school.edu" }

            [[subjects.schedule]]
            days = ["mon", "wed"]
            start = "10:00"
            end = "11:00"

            [[subjects.roster]]
            user_id = "stu-1"
            name = "Jane Doe"
            email = "jane@school.edu"
            email_verified = true
        "#;

        let config: RawConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.subjects.len(), 1);
        let subject = &config.subjects[0];
        assert_eq!(subject.id, "math-101");
        assert_eq!(subject.schedule.len(), 1);
        assert_eq!(subject.roster[0].user_id, "stu-1");
        assert!(subject.roster[0].email_verified);
        assert!(!subject.roster[0].student_id_verified);
    }

    #[test]
    fn engine_section_is_optional() {
        let config: RawConfig = toml::from_str("config_version = 1").unwrap();
        assert!(config.engine.tardy_fraction.is_none());
        assert!(config.subjects.is_empty());
    }
}
