//! Shared types for the rollcalld API

use chrono::{DateTime, Local, NaiveDate};
use rollcall_util::{MeetCode, SessionId, SubjectId, UserId};
use serde::{Deserialize, Serialize};

/// Per-participant attendance outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Present,
    Late,
    Absent,
    Pending,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Late => "late",
            AttendanceStatus::Absent => "absent",
            AttendanceStatus::Pending => "pending",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "present" => Some(AttendanceStatus::Present),
            "late" => Some(AttendanceStatus::Late),
            "absent" => Some(AttendanceStatus::Absent),
            "pending" => Some(AttendanceStatus::Pending),
            _ => None,
        }
    }
}

/// Lifecycle of a session. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Scheduled,
    Active,
    Completed,
    Cancelled,
}

impl SessionStatus {
    /// Ordering used by guarded status writes; both terminal states share a rank
    pub fn rank(&self) -> i64 {
        match self {
            SessionStatus::Scheduled => 0,
            SessionStatus::Active => 1,
            SessionStatus::Completed | SessionStatus::Cancelled => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() >= 2
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Scheduled => "scheduled",
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(SessionStatus::Scheduled),
            "active" => Some(SessionStatus::Active),
            "completed" => Some(SessionStatus::Completed),
            "cancelled" => Some(SessionStatus::Cancelled),
            _ => None,
        }
    }
}

/// Tag on realtime attendance events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusTransition {
    /// Non-authoritative, for UI continuity only
    Leaving,
    /// Ground truth
    Finalized,
}

/// How sure the instructor detector is about its pick
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionConfidence {
    Low,
    Medium,
    High,
}

/// Warning severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningSeverity {
    Info,
    Warn,
    Critical,
}

/// Machine-readable warning kinds returned inline with a successful submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningCode {
    IdentityUnresolved,
    InstructorNotDetected,
    NonPositiveInterval,
    ParticipantSkipped,
    StorageFault,
    StaleUpdate,
    PlaceholderSession,
}

/// One per-participant (or per-session) problem that did not fail the submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionWarning {
    pub severity: WarningSeverity,
    pub code: WarningCode,
    /// Scraped display name the warning is about, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<String>,
    pub message: String,
}

impl SubmissionWarning {
    pub fn new(severity: WarningSeverity, code: WarningCode, message: impl Into<String>) -> Self {
        Self {
            severity,
            code,
            participant: None,
            message: message.into(),
        }
    }

    pub fn for_participant(mut self, name: impl Into<String>) -> Self {
        self.participant = Some(name.into());
        self
    }
}

/// Outbound per-participant record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRecordView {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_id: Option<String>,
    pub status: AttendanceStatus,
    pub join_time: Option<DateTime<Local>>,
    pub leave_time: Option<DateTime<Local>>,
    pub duration_seconds: i64,
    pub is_tardy: bool,
    pub tardiness_count: i64,
    pub time_to_enter_seconds: Option<i64>,
    pub leave_count: i64,
    pub return_count: i64,
    pub in_meeting: bool,
    pub synchronized: bool,
    pub finalized: bool,
    pub excused: bool,
}

/// Detected instructor of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructorView {
    pub display_name: String,
    pub user_id: Option<UserId>,
    /// Name of the detection strategy that matched
    pub strategy: String,
    pub confidence: DetectionConfidence,
    pub join_time: Option<DateTime<Local>>,
    pub leave_time: Option<DateTime<Local>>,
    pub late: bool,
}

/// Response to an attendance submission or progress ping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionReceipt {
    pub session_id: SessionId,
    pub meet_code: MeetCode,
    pub day: NaiveDate,
    /// The payload had already been fully processed; nothing was written
    pub existing: bool,
    pub session_status: SessionStatus,
    pub meeting_ended: bool,
    pub instructor: Option<InstructorView>,
    pub records: Vec<ParticipantRecordView>,
    /// Participants resolved to a roster member (instructor excluded)
    pub matched: usize,
    pub warnings: Vec<SubmissionWarning>,
    /// Highest-severity warning message, if any
    pub summary: Option<String>,
    /// Records finalized as a consequence of this submission
    pub finalized: usize,
}

/// Full view of one session with its records
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: SessionId,
    pub meet_code: MeetCode,
    pub day: NaiveDate,
    pub subject_id: Option<SubjectId>,
    pub placeholder: bool,
    pub status: SessionStatus,
    pub start_time: DateTime<Local>,
    pub end_time: DateTime<Local>,
    pub first_third_threshold: DateTime<Local>,
    pub grace_period: bool,
    pub instructor_join_time: Option<DateTime<Local>>,
    pub instructor_leave_time: Option<DateTime<Local>>,
    pub instructor_late: bool,
    pub meeting_ended: bool,
    pub finalized_at: Option<DateTime<Local>>,
    pub unmatched: Vec<String>,
    pub participants: Vec<ParticipantRecordView>,
}

/// Issued submission-authorization token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenGrant {
    pub token: String,
    pub session_id: SessionId,
    pub valid_from: DateTime<Local>,
    pub expires_at: DateTime<Local>,
}

/// Result of a successful single-use token consumption
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenConsumed {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub consumed_at: DateTime<Local>,
}

/// What caused a finalization pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeTrigger {
    /// Instructor leave detected; meeting marked ended
    InstructorLeft,
    /// Scheduled end plus the timeout has passed without a detected end
    Timeout,
    /// Explicit request
    Manual,
}

/// Outcome of one finalization pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeReport {
    pub session_id: SessionId,
    pub trigger: FinalizeTrigger,
    pub newly_finalized: usize,
    pub present: usize,
    pub late: usize,
    pub absent: usize,
    /// Records whose finalization hit a storage fault and were skipped
    pub failed: usize,
    pub tokens_expired: usize,
}

impl FinalizeReport {
    pub fn empty(session_id: SessionId, trigger: FinalizeTrigger) -> Self {
        Self {
            session_id,
            trigger,
            newly_finalized: 0,
            present: 0,
            late: 0,
            absent: 0,
            failed: 0,
            tokens_expired: 0,
        }
    }
}

/// Last known presence of a participant, from progress pings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveParticipant {
    pub display_name: String,
    pub user_id: Option<UserId>,
    pub in_meeting: bool,
    pub joined_at: Option<DateTime<Local>>,
    pub seen_at: DateTime<Local>,
}

/// Role for authorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientRole {
    /// Scraper relay or dashboard - can submit, query and request tokens
    Reporter,
    /// Local admin - can also override statuses and force finalization
    Admin,
}

impl ClientRole {
    pub fn can_submit(&self) -> bool {
        matches!(self, ClientRole::Reporter | ClientRole::Admin)
    }

    pub fn can_force_finalize(&self) -> bool {
        matches!(self, ClientRole::Admin)
    }

    pub fn can_override(&self) -> bool {
        matches!(self, ClientRole::Admin)
    }
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub live: bool,
    pub ready: bool,
    pub store_ok: bool,
    pub subject_count: usize,
    pub open_sessions: usize,
}
