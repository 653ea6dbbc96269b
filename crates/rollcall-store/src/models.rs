//! Persisted records

use chrono::{DateTime, Local, NaiveDate};
use rollcall_api::{AttendanceStatus, SessionStatus};
use rollcall_util::{MeetCode, SessionId, SubjectId, UserId};

/// Schedule-derived fields of a session. Written on create and once more
/// when a placeholder is refined.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionFields {
    pub subject_id: Option<SubjectId>,
    pub is_placeholder: bool,
    pub start_time: DateTime<Local>,
    pub end_time: DateTime<Local>,
    /// start + (end - start) / 3
    pub first_third: DateTime<Local>,
    pub grace_period: bool,
}

/// One meeting occurrence, unique per (meet code, day)
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: SessionId,
    pub meet_code: MeetCode,
    pub day: NaiveDate,
    pub fields: SessionFields,
    pub status: SessionStatus,
    pub instructor_join: Option<DateTime<Local>>,
    pub instructor_leave: Option<DateTime<Local>>,
    pub instructor_late: bool,
    pub meeting_ended: bool,
    /// Bounded log of scraped names that matched nobody, oldest first
    pub unmatched: Vec<String>,
    pub finalized_at: Option<DateTime<Local>>,
    pub created_at: DateTime<Local>,
    pub updated_at: DateTime<Local>,
}

impl SessionRecord {
    pub fn new(
        meet_code: MeetCode,
        day: NaiveDate,
        fields: SessionFields,
        now: DateTime<Local>,
    ) -> Self {
        Self {
            id: SessionId::new(),
            meet_code,
            day,
            fields,
            status: SessionStatus::Scheduled,
            instructor_join: None,
            instructor_leave: None,
            instructor_late: false,
            meeting_ended: false,
            unmatched: Vec::new(),
            finalized_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized_at.is_some()
    }

    pub fn scheduled_duration(&self) -> chrono::Duration {
        self.fields.end_time - self.fields.start_time
    }
}

/// Reconciled presence of one user in one session
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantRecord {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub display_name: String,
    pub student_id: Option<String>,
    pub status: AttendanceStatus,
    /// Immutable once set
    pub first_join: Option<DateTime<Local>>,
    pub last_leave: Option<DateTime<Local>>,
    pub last_return: Option<DateTime<Local>>,
    pub in_meeting: bool,
    pub leave_count: i64,
    pub return_count: i64,
    /// Sum of closed presence intervals. Never decreases.
    pub credited_secs: i64,
    /// max(credited, highest reported cumulative). Never decreases.
    pub total_duration_secs: i64,
    pub time_to_enter_secs: Option<i64>,
    pub is_tardy: bool,
    pub tardiness_count: i64,
    pub synchronized: bool,
    pub pending_since: Option<DateTime<Local>>,
    pub finalized: bool,
    pub finalized_at: Option<DateTime<Local>>,
    pub excused: bool,
    pub overridden_by: Option<String>,
    pub updated_at: DateTime<Local>,
}

impl ParticipantRecord {
    /// Absent placeholder for a roster member nobody has seen yet
    pub fn baseline(
        session_id: SessionId,
        user_id: UserId,
        display_name: impl Into<String>,
        student_id: Option<String>,
        now: DateTime<Local>,
    ) -> Self {
        Self {
            session_id,
            user_id,
            display_name: display_name.into(),
            student_id,
            status: AttendanceStatus::Absent,
            first_join: None,
            last_leave: None,
            last_return: None,
            in_meeting: false,
            leave_count: 0,
            return_count: 0,
            credited_secs: 0,
            total_duration_secs: 0,
            time_to_enter_secs: None,
            is_tardy: false,
            tardiness_count: 0,
            synchronized: false,
            pending_since: None,
            finalized: false,
            finalized_at: None,
            excused: false,
            overridden_by: None,
            updated_at: now,
        }
    }

    pub fn has_joined(&self) -> bool {
        self.first_join.is_some()
    }
}

/// Terminal values written when a record is finalized
#[derive(Debug, Clone, PartialEq)]
pub struct FinalOutcome {
    pub status: AttendanceStatus,
    pub is_tardy: bool,
    pub tardiness_count: i64,
}

/// Submission-authorization token
#[derive(Debug, Clone, PartialEq)]
pub struct TokenRecord {
    pub token: String,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub subject_id: Option<SubjectId>,
    pub valid_from: DateTime<Local>,
    pub expires_at: DateTime<Local>,
    pub consumed: bool,
    pub consumed_at: Option<DateTime<Local>>,
    pub consumed_by: Option<String>,
    pub created_at: DateTime<Local>,
}

impl TokenRecord {
    pub fn is_usable_at(&self, now: DateTime<Local>) -> bool {
        !self.consumed && now <= self.expires_at
    }
}
