//! Configuration parsing and validation for rollcalld
//!
//! Supports TOML configuration with:
//! - Versioned schema
//! - Engine tunables (tardiness fraction, synchronization tolerances, timeouts)
//! - Subject catalog with weekly schedules, instructors and rosters
//! - Validation with clear error messages

mod policy;
mod schema;
mod validation;

pub use policy::*;
pub use schema::*;
pub use validation::*;

use std::path::Path;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation failed: {errors:?}")]
    ValidationFailed { errors: Vec<ValidationError> },

    #[error("Unsupported config version: {0}")]
    UnsupportedVersion(u32),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Load and validate configuration from a TOML file
pub fn load_config(path: impl AsRef<Path>) -> ConfigResult<Policy> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse and validate configuration from a TOML string
pub fn parse_config(content: &str) -> ConfigResult<Policy> {
    let raw: RawConfig = toml::from_str(content)?;

    if raw.config_version != CURRENT_CONFIG_VERSION {
        return Err(ConfigError::UnsupportedVersion(raw.config_version));
    }

    let errors = validate_config(&raw);
    if !errors.is_empty() {
        return Err(ConfigError::ValidationFailed { errors });
    }

    let policy = Policy::from_raw(raw);
    tracing::debug!(
        subjects = policy.subjects.len(),
        require_token = policy.engine.require_token,
        "Configuration parsed"
    );
    Ok(policy)
}

/// Current supported config version
pub const CURRENT_CONFIG_VERSION: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::io::Write;

    const SAMPLE: &str = r#"
        config_version = 1

        [engine]
        tardy_fraction = 0.25
        sync_tolerance_before_ms = 100

        [[subjects]]
        id = "math-101"
        name = "Calculus I"
        meet_code = "https://meet.google.com/ABC-defg-hij"
        add_drop_until = "2024-01-07"
        instructor = { user_id = "prof-1", name = "Alan Turing" }

        [[subjects.schedule]]
        days = "weekdays"
        start = "10:00"
        end = "11:00"

        [[subjects.roster]]
        user_id = "stu-1"
        name = "Jane Doe"
    "#;

    #[test]
    fn parse_minimal_config() {
        let policy = parse_config(SAMPLE).unwrap();
        assert_eq!(policy.subjects.len(), 1);

        let subject = &policy.subjects[0];
        assert_eq!(subject.id.as_str(), "math-101");
        assert_eq!(
            subject.meet_code.as_ref().map(|c| c.as_str()),
            Some("abc-defg-hij")
        );
        assert_eq!(
            subject.add_drop_until,
            NaiveDate::from_ymd_opt(2024, 1, 7)
        );
        assert_eq!(subject.roster.len(), 1);

        let code = rollcall_util::MeetCode::parse("abc-defg-hij").unwrap();
        assert!(policy.subject_for_meet_code(&code).is_some());
    }

    #[test]
    fn reject_wrong_version() {
        let result = parse_config("config_version = 99");
        assert!(matches!(result, Err(ConfigError::UnsupportedVersion(99))));
    }

    #[test]
    fn reject_invalid_config() {
        let config = r#"
            config_version = 1

            [engine]
            tardy_fraction = 0.0
        "#;
        let result = parse_config(config);
        assert!(matches!(result, Err(ConfigError::ValidationFailed { .. })));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let policy = load_config(file.path()).unwrap();
        assert_eq!(policy.subjects[0].name, "Calculus I");
    }
}
