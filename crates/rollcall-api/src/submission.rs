//! Inbound telemetry shape produced by the browser-side scraper
//!
//! Every field is optional and several have historical aliases; the engine
//! normalizes this once at ingestion and never looks at it again.

use rollcall_util::SubjectId;
use serde::{Deserialize, Serialize};

/// A raw timestamp as scraped: either epoch milliseconds or free text
/// (RFC 3339, naive ISO, `HH:MM[:SS]`, `h:mm AM`, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTime {
    Millis(i64),
    Text(String),
}

impl From<&str> for RawTime {
    fn from(s: &str) -> Self {
        RawTime::Text(s.to_string())
    }
}

/// A raw attended duration: seconds, or `HH:MM:SS` / `MM:SS` text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawDuration {
    Seconds(f64),
    Text(String),
}

/// Attendance submission or progress ping for one meeting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceSubmission {
    #[serde(default, alias = "meet_code", alias = "meetingCode", skip_serializing_if = "Option::is_none")]
    pub meet_code: Option<String>,

    /// Calendar day of the meeting, `YYYY-MM-DD`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,

    #[serde(default, alias = "meetingStart", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<RawTime>,

    #[serde(default, alias = "endTime", alias = "meetingEnd", skip_serializing_if = "Option::is_none")]
    pub stop_time: Option<RawTime>,

    /// Absent (as opposed to empty) is a validation fault
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participants: Option<Vec<RawParticipant>>,

    #[serde(default, alias = "subject_id", skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<SubjectId>,

    #[serde(default, alias = "token", skip_serializing_if = "Option::is_none")]
    pub verification_token: Option<String>,
}

/// One scraped participant row
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawParticipant {
    #[serde(default, alias = "displayName", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, alias = "user_id", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(default, alias = "student_id", skip_serializing_if = "Option::is_none")]
    pub student_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_time_iso: Option<RawTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_time: Option<RawTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_in: Option<RawTime>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leave_time_iso: Option<RawTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leave_time: Option<RawTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_out: Option<RawTime>,

    #[serde(default, alias = "durationSeconds", skip_serializing_if = "Option::is_none")]
    pub attended_duration: Option<RawDuration>,

    #[serde(default, alias = "host", skip_serializing_if = "Option::is_none")]
    pub is_host: Option<bool>,
}

impl RawParticipant {
    /// Preferred join stamp: `joinTimeIso`, then `joinTime`, then `timeIn`
    pub fn join_raw(&self) -> Option<&RawTime> {
        self.join_time_iso
            .as_ref()
            .or(self.join_time.as_ref())
            .or(self.time_in.as_ref())
    }

    /// Preferred leave stamp: `leaveTimeIso`, then `leaveTime`, then `timeOut`
    pub fn leave_raw(&self) -> Option<&RawTime> {
        self.leave_time_iso
            .as_ref()
            .or(self.leave_time.as_ref())
            .or(self.time_out.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_are_accepted() {
        let json = r#"{
            "meetingCode": "abc-defg-hij",
            "date": "2024-01-01",
            "meetingStart": "10:00",
            "endTime": 1704106800000,
            "participants": [
                { "displayName": "Jane Doe", "timeIn": "10:05:00", "host": false, "durationSeconds": 120 }
            ],
            "token": "t-1"
        }"#;
        let sub: AttendanceSubmission = serde_json::from_str(json).unwrap();

        assert_eq!(sub.meet_code.as_deref(), Some("abc-defg-hij"));
        assert_eq!(sub.start_time, Some(RawTime::Text("10:00".into())));
        assert_eq!(sub.stop_time, Some(RawTime::Millis(1704106800000)));
        assert_eq!(sub.verification_token.as_deref(), Some("t-1"));

        let p = &sub.participants.as_ref().unwrap()[0];
        assert_eq!(p.name.as_deref(), Some("Jane Doe"));
        assert_eq!(p.join_raw(), Some(&RawTime::Text("10:05:00".into())));
        assert_eq!(p.attended_duration, Some(RawDuration::Seconds(120.0)));
        assert_eq!(p.is_host, Some(false));
    }

    #[test]
    fn iso_alias_wins_over_plain_time() {
        let p = RawParticipant {
            join_time: Some("10:05".into()),
            join_time_iso: Some("2024-01-01T10:04:59.500+00:00".into()),
            time_out: Some("10:30".into()),
            ..Default::default()
        };
        assert_eq!(
            p.join_raw(),
            Some(&RawTime::Text("2024-01-01T10:04:59.500+00:00".into()))
        );
        assert_eq!(p.leave_raw(), Some(&RawTime::Text("10:30".into())));
    }

    #[test]
    fn missing_participants_is_distinct_from_empty() {
        let missing: AttendanceSubmission =
            serde_json::from_str(r#"{"meetCode":"x","date":"2024-01-01"}"#).unwrap();
        let empty: AttendanceSubmission =
            serde_json::from_str(r#"{"meetCode":"x","date":"2024-01-01","participants":[]}"#)
                .unwrap();
        assert!(missing.participants.is_none());
        assert_eq!(empty.participants.map(|p| p.len()), Some(0));
    }
}
