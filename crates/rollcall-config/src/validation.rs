//! Configuration validation

use crate::schema::{RawConfig, RawDays, RawEngineConfig, RawSubject, RawTimeWindow};
use chrono::NaiveDate;
use rollcall_util::MeetCode;
use std::collections::HashSet;
use thiserror::Error;

/// Validation error
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("Subject '{subject_id}': {message}")]
    SubjectError { subject_id: String, message: String },

    #[error("Duplicate subject ID: {0}")]
    DuplicateSubjectId(String),

    #[error("Meet code '{meet_code}' is used by more than one subject")]
    DuplicateMeetCode { meet_code: String },

    #[error("Invalid time format '{value}': {message}")]
    InvalidTimeFormat { value: String, message: String },

    #[error("Invalid date '{value}': expected YYYY-MM-DD")]
    InvalidDate { value: String },

    #[error("Engine setting '{setting}': {message}")]
    EngineError { setting: String, message: String },
}

/// Validate a raw configuration
pub fn validate_config(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = validate_engine(&config.engine);

    let mut seen_ids = HashSet::new();
    let mut seen_codes = HashSet::new();
    for subject in &config.subjects {
        if !seen_ids.insert(&subject.id) {
            errors.push(ValidationError::DuplicateSubjectId(subject.id.clone()));
        }
        if let Some(code) = subject.meet_code.as_deref().and_then(MeetCode::parse)
            && !seen_codes.insert(code.clone())
        {
            errors.push(ValidationError::DuplicateMeetCode {
                meet_code: code.to_string(),
            });
        }
    }

    for subject in &config.subjects {
        errors.extend(validate_subject(subject));
    }

    errors
}

fn validate_engine(engine: &RawEngineConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if let Some(fraction) = engine.tardy_fraction
        && !(fraction > 0.0 && fraction < 1.0)
    {
        errors.push(ValidationError::EngineError {
            setting: "tardy_fraction".into(),
            message: format!("must be between 0 and 1 (exclusive), got {}", fraction),
        });
    }

    if engine.unmatched_log_capacity == Some(0) {
        errors.push(ValidationError::EngineError {
            setting: "unmatched_log_capacity".into(),
            message: "must be at least 1".into(),
        });
    }

    if engine.live_cache_max_entries == Some(0) {
        errors.push(ValidationError::EngineError {
            setting: "live_cache_max_entries".into(),
            message: "must be at least 1".into(),
        });
    }

    if engine.tick_interval_seconds == Some(0) {
        errors.push(ValidationError::EngineError {
            setting: "tick_interval_seconds".into(),
            message: "must be at least 1".into(),
        });
    }

    errors
}

fn validate_subject(subject: &RawSubject) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let subject_error = |message: String| ValidationError::SubjectError {
        subject_id: subject.id.clone(),
        message,
    };

    if subject.id.trim().is_empty() {
        errors.push(subject_error("id cannot be empty".into()));
    }

    if let Some(raw) = &subject.meet_code
        && MeetCode::parse(raw).is_none()
    {
        errors.push(subject_error(format!("invalid meet code '{}'", raw)));
    }

    for window in &subject.schedule {
        errors.extend(validate_time_window(window, &subject.id));
    }

    if let Some(raw) = &subject.add_drop_until
        && parse_date(raw).is_err()
    {
        errors.push(ValidationError::InvalidDate { value: raw.clone() });
    }

    if let Some(instructor) = &subject.instructor
        && instructor.name.trim().is_empty()
    {
        errors.push(subject_error("instructor name cannot be empty".into()));
    }

    let mut seen_members = HashSet::new();
    for member in &subject.roster {
        if member.user_id.trim().is_empty() || member.name.trim().is_empty() {
            errors.push(subject_error(
                "roster member needs both user_id and name".into(),
            ));
            continue;
        }
        if !seen_members.insert(&member.user_id) {
            errors.push(subject_error(format!(
                "duplicate roster member '{}'",
                member.user_id
            )));
        }
    }

    errors
}

fn validate_time_window(window: &RawTimeWindow, subject_id: &str) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if let Err(e) = parse_days(&window.days) {
        errors.push(ValidationError::SubjectError {
            subject_id: subject_id.to_string(),
            message: e,
        });
    }

    let start = parse_time(&window.start);
    if let Err(e) = &start {
        errors.push(ValidationError::InvalidTimeFormat {
            value: window.start.clone(),
            message: e.clone(),
        });
    }

    let end = parse_time(&window.end);
    if let Err(e) = &end {
        errors.push(ValidationError::InvalidTimeFormat {
            value: window.end.clone(),
            message: e.clone(),
        });
    }

    if let (Ok(start), Ok(end)) = (start, end)
        && start >= end
    {
        errors.push(ValidationError::SubjectError {
            subject_id: subject_id.to_string(),
            message: format!("class slot {}-{} ends before it starts", window.start, window.end),
        });
    }

    errors
}

/// Parse HH:MM time format
pub fn parse_time(s: &str) -> Result<(u8, u8), String> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 2 {
        return Err("Expected HH:MM format".into());
    }

    let hour: u8 = parts[0]
        .parse()
        .map_err(|_| "Invalid hour".to_string())?;
    let minute: u8 = parts[1]
        .parse()
        .map_err(|_| "Invalid minute".to_string())?;

    if hour >= 24 {
        return Err("Hour must be 0-23".into());
    }
    if minute >= 60 {
        return Err("Minute must be 0-59".into());
    }

    Ok((hour, minute))
}

/// Parse YYYY-MM-DD date format
pub fn parse_date(s: &str) -> Result<NaiveDate, String> {
    rollcall_util::parse_day(s).ok_or_else(|| "Expected YYYY-MM-DD format".to_string())
}

/// Parse days specification
pub fn parse_days(days: &RawDays) -> Result<u8, String> {
    match days {
        RawDays::Preset(preset) => match preset.to_lowercase().as_str() {
            "all" | "every" | "daily" => Ok(0x7F),
            "weekdays" => Ok(0x1F), // Mon-Fri
            "weekends" => Ok(0x60), // Sat-Sun
            other => Err(format!("Unknown day preset: {}", other)),
        },
        RawDays::List(list) => {
            let mut mask = 0u8;
            for day in list {
                let bit = match day.to_lowercase().as_str() {
                    "mon" | "monday" => 1 << 0,
                    "tue" | "tuesday" => 1 << 1,
                    "wed" | "wednesday" => 1 << 2,
                    "thu" | "thursday" => 1 << 3,
                    "fri" | "friday" => 1 << 4,
                    "sat" | "saturday" => 1 << 5,
                    "sun" | "sunday" => 1 << 6,
                    other => return Err(format!("Unknown day: {}", other)),
                };
                mask |= bit;
            }
            if mask == 0 {
                return Err("Day list cannot be empty".into());
            }
            Ok(mask)
        }
    }
}
