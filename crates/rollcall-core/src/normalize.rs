//! One-time normalization of scraped submissions
//!
//! Everything downstream works on [`NormalizedSubmission`]: canonical meet
//! code, calendar day, local timestamps and whole-second durations. Raw
//! aliases and text formats never leave this module.

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use rollcall_api::{
    AttendanceSubmission, RawDuration, RawParticipant, RawTime, SubmissionWarning, WarningCode,
    WarningSeverity,
};
use rollcall_util::{local_datetime, parse_day, MeetCode, RollcallError, Result, SubjectId};
use tracing::debug;

const DATE_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

const TIME_FORMATS: &[&str] = &["%H:%M:%S%.f", "%H:%M", "%I:%M:%S %p", "%I:%M %p"];

/// One participant observation, in canonical form
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// Whitespace-collapsed display name
    pub name: String,
    pub user_id: Option<String>,
    pub email: Option<String>,
    pub student_id: Option<String>,
    pub join: Option<DateTime<Local>>,
    pub leave: Option<DateTime<Local>>,
    /// Cumulative attended time as reported by the scraper, whole seconds
    pub reported_secs: Option<i64>,
    pub is_host: bool,
}

impl Observation {
    /// Bare observation with just a name (tests and synthetic inputs)
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: collapse_whitespace(&name.into()),
            user_id: None,
            email: None,
            student_id: None,
            join: None,
            leave: None,
            reported_secs: None,
            is_host: false,
        }
    }
}

/// A submission after normalization
#[derive(Debug, Clone)]
pub struct NormalizedSubmission {
    pub meet_code: MeetCode,
    pub day: NaiveDate,
    pub start: Option<DateTime<Local>>,
    pub stop: Option<DateTime<Local>>,
    pub subject_id: Option<SubjectId>,
    pub token: Option<String>,
    pub participants: Vec<Observation>,
    /// Rows dropped during normalization
    pub warnings: Vec<SubmissionWarning>,
}

impl NormalizedSubmission {
    /// Earliest timestamp carried by any observation
    pub fn earliest_observed(&self) -> Option<DateTime<Local>> {
        self.participants
            .iter()
            .flat_map(|p| [p.join, p.leave])
            .flatten()
            .min()
    }

    /// Latest timestamp carried by any observation
    pub fn latest_observed(&self) -> Option<DateTime<Local>> {
        self.participants
            .iter()
            .flat_map(|p| [p.join, p.leave])
            .flatten()
            .max()
    }
}

/// Validate and normalize a raw submission.
///
/// Missing meet code, date or participant list rejects the whole submission.
/// Individual participant rows that cannot be read are skipped with a warning.
pub fn normalize(raw: &AttendanceSubmission) -> Result<NormalizedSubmission> {
    let meet_code = raw
        .meet_code
        .as_deref()
        .ok_or_else(|| RollcallError::validation("missing meetCode"))
        .and_then(|code| {
            MeetCode::parse(code)
                .ok_or_else(|| RollcallError::validation(format!("invalid meetCode '{}'", code)))
        })?;

    let day = raw
        .date
        .as_deref()
        .ok_or_else(|| RollcallError::validation("missing date"))
        .and_then(|date| {
            parse_day(date.trim())
                .ok_or_else(|| RollcallError::validation(format!("invalid date '{}'", date)))
        })?;

    let rows = raw
        .participants
        .as_ref()
        .ok_or_else(|| RollcallError::validation("missing participants"))?;

    let start = raw.start_time.as_ref().and_then(|t| parse_time(t, day));
    let stop = raw.stop_time.as_ref().and_then(|t| parse_time(t, day));

    let mut participants = Vec::with_capacity(rows.len());
    let mut warnings = Vec::new();
    for row in rows {
        match normalize_participant(row, day) {
            Ok(obs) => participants.push(obs),
            Err(warning) => warnings.push(warning),
        }
    }

    debug!(
        meet_code = %meet_code,
        day = %day,
        participants = participants.len(),
        skipped = warnings.len(),
        "Submission normalized"
    );

    Ok(NormalizedSubmission {
        meet_code,
        day,
        start,
        stop,
        subject_id: raw.subject_id.clone(),
        token: raw
            .verification_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string),
        participants,
        warnings,
    })
}

fn normalize_participant(
    row: &RawParticipant,
    day: NaiveDate,
) -> std::result::Result<Observation, SubmissionWarning> {
    let name = row
        .name
        .as_deref()
        .map(collapse_whitespace)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| {
            SubmissionWarning::new(
                WarningSeverity::Warn,
                WarningCode::ParticipantSkipped,
                "participant row without a name",
            )
        })?;

    let unreadable = |what: &str| {
        SubmissionWarning::new(
            WarningSeverity::Warn,
            WarningCode::ParticipantSkipped,
            format!("unreadable {} time", what),
        )
        .for_participant(&name)
    };

    let join = match row.join_raw() {
        Some(raw) => Some(parse_time(raw, day).ok_or_else(|| unreadable("join"))?),
        None => None,
    };
    let leave = match row.leave_raw() {
        Some(raw) => Some(parse_time(raw, day).ok_or_else(|| unreadable("leave"))?),
        None => None,
    };

    Ok(Observation {
        user_id: non_empty(row.user_id.as_deref()),
        email: non_empty(row.email.as_deref()).map(|e| e.to_lowercase()),
        student_id: non_empty(row.student_id.as_deref()),
        join,
        leave,
        reported_secs: row.attended_duration.as_ref().and_then(parse_duration),
        is_host: row.is_host.unwrap_or(false),
        name,
    })
}

fn non_empty(s: Option<&str>) -> Option<String> {
    s.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

/// Trim and collapse internal runs of whitespace
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse a scraped timestamp. Bare times of day are anchored to `day`.
pub fn parse_time(raw: &RawTime, day: NaiveDate) -> Option<DateTime<Local>> {
    match raw {
        RawTime::Millis(ms) => Local.timestamp_millis_opt(*ms).single(),
        RawTime::Text(text) => parse_time_text(text.trim(), day),
    }
}

fn parse_time_text(text: &str, day: NaiveDate) -> Option<DateTime<Local>> {
    if text.is_empty() {
        return None;
    }

    // Epoch millis sent as a string
    if text.len() >= 12 && text.chars().all(|c| c.is_ascii_digit()) {
        return text
            .parse::<i64>()
            .ok()
            .and_then(|ms| Local.timestamp_millis_opt(ms).single());
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Local));
    }

    for format in DATE_TIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return local_datetime(naive.date(), naive.time());
        }
    }

    let upper = text.to_uppercase();
    for format in TIME_FORMATS {
        if let Ok(time) = NaiveTime::parse_from_str(&upper, format) {
            return local_datetime(day, time);
        }
    }

    None
}

/// Parse a reported cumulative duration into whole seconds
pub fn parse_duration(raw: &RawDuration) -> Option<i64> {
    match raw {
        RawDuration::Seconds(secs) if secs.is_finite() && *secs >= 0.0 => Some(secs.trunc() as i64),
        RawDuration::Seconds(_) => None,
        RawDuration::Text(text) => {
            let text = text.trim();
            if let Ok(secs) = text.parse::<f64>() {
                return parse_duration(&RawDuration::Seconds(secs));
            }

            let parts: Vec<&str> = text.split(':').collect();
            if parts.len() < 2 || parts.len() > 3 {
                return None;
            }
            let mut total: i64 = 0;
            for part in parts {
                let value: i64 = part.trim().parse().ok()?;
                if value < 0 {
                    return None;
                }
                total = total * 60 + value;
            }
            Some(total)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use rollcall_api::RawParticipant;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
    }

    fn submission(participants: Option<Vec<RawParticipant>>) -> AttendanceSubmission {
        AttendanceSubmission {
            meet_code: Some("https://meet.google.com/abc-defg-hij".into()),
            date: Some("2024-01-15".into()),
            participants,
            ..Default::default()
        }
    }

    #[test]
    fn missing_required_fields_are_rejected() {
        let mut sub = submission(Some(vec![]));
        sub.meet_code = None;
        assert!(matches!(normalize(&sub), Err(RollcallError::Validation(_))));

        let mut sub = submission(Some(vec![]));
        sub.date = Some("15/01/2024".into());
        assert!(matches!(normalize(&sub), Err(RollcallError::Validation(_))));

        let sub = submission(None);
        assert!(matches!(normalize(&sub), Err(RollcallError::Validation(_))));
    }

    #[test]
    fn empty_participant_list_is_accepted() {
        let normalized = normalize(&submission(Some(vec![]))).unwrap();
        assert_eq!(normalized.meet_code.as_str(), "abc-defg-hij");
        assert!(normalized.participants.is_empty());
    }

    #[test]
    fn time_formats() {
        let at = |raw: &str| parse_time(&RawTime::from(raw), day()).unwrap();

        assert_eq!(at("10:05").hour(), 10);
        assert_eq!(at("10:05:30").second(), 30);
        assert_eq!(at("2:05 pm").hour(), 14);
        assert_eq!(at("02:05:10 PM").hour(), 14);
        assert_eq!(at("2024-01-15T10:05:00").minute(), 5);
        assert_eq!(at("2024-01-15 10:05:00.250").nanosecond(), 250_000_000);

        let epoch = Local.with_ymd_and_hms(2024, 1, 15, 10, 5, 0).unwrap();
        let millis = epoch.timestamp_millis();
        assert_eq!(parse_time(&RawTime::Millis(millis), day()), Some(epoch));
        assert_eq!(at(&millis.to_string()), epoch);

        assert_eq!(parse_time(&RawTime::from("soon"), day()), None);
        assert_eq!(parse_time(&RawTime::from(""), day()), None);
    }

    #[test]
    fn join_alias_precedence() {
        let row = RawParticipant {
            name: Some("Jane Doe".into()),
            join_time_iso: Some("2024-01-15T10:05:00".into()),
            time_in: Some("10:30".into()),
            ..Default::default()
        };
        let obs = normalize_participant(&row, day()).unwrap();
        assert_eq!(obs.join.unwrap().minute(), 5);
    }

    #[test]
    fn unreadable_rows_are_skipped_with_warning() {
        let rows = vec![
            RawParticipant {
                name: Some("  Jane   Doe ".into()),
                time_in: Some("10:05".into()),
                ..Default::default()
            },
            RawParticipant {
                name: Some("Bad Clock".into()),
                time_in: Some("quarter past".into()),
                ..Default::default()
            },
            RawParticipant {
                name: Some("   ".into()),
                ..Default::default()
            },
        ];
        let normalized = normalize(&submission(Some(rows))).unwrap();

        assert_eq!(normalized.participants.len(), 1);
        assert_eq!(normalized.participants[0].name, "Jane Doe");
        assert_eq!(normalized.warnings.len(), 2);
        assert!(normalized
            .warnings
            .iter()
            .all(|w| w.code == WarningCode::ParticipantSkipped));
        assert_eq!(normalized.warnings[0].participant.as_deref(), Some("Bad Clock"));
    }

    #[test]
    fn duration_formats() {
        assert_eq!(parse_duration(&RawDuration::Seconds(125.9)), Some(125));
        assert_eq!(parse_duration(&RawDuration::Seconds(-1.0)), None);
        assert_eq!(parse_duration(&RawDuration::Text("01:02:03".into())), Some(3723));
        assert_eq!(parse_duration(&RawDuration::Text("05:30".into())), Some(330));
        assert_eq!(parse_duration(&RawDuration::Text("90".into())), Some(90));
        assert_eq!(parse_duration(&RawDuration::Text("a while".into())), None);
    }
}
