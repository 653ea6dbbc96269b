//! Audit event types

use chrono::{DateTime, Local, NaiveDate};
use rollcall_api::{AttendanceStatus, FinalizeTrigger};
use rollcall_util::{MeetCode, SessionId, SubjectId, UserId};
use serde::{Deserialize, Serialize};

/// Types of audit events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEventType {
    /// Service started
    ServiceStarted,

    /// Service stopped
    ServiceStopped,

    /// Policy loaded
    PolicyLoaded { subject_count: usize },

    /// Session created for a (meet code, day) key
    SessionRegistered {
        session_id: SessionId,
        meet_code: MeetCode,
        day: NaiveDate,
        placeholder: bool,
    },

    /// Placeholder session upgraded with subject context
    SessionRefined {
        session_id: SessionId,
        subject_id: SubjectId,
    },

    /// Instructor leave detected
    MeetingEnded {
        session_id: SessionId,
        instructor_leave: DateTime<Local>,
    },

    /// Finalization pass completed
    SessionFinalized {
        session_id: SessionId,
        trigger: FinalizeTrigger,
        newly_finalized: usize,
    },

    /// Scraped names that matched no roster member
    ParticipantsUnmatched {
        session_id: SessionId,
        names: Vec<String>,
    },

    /// Manual status change on a finalized record (admin action)
    StatusOverridden {
        session_id: SessionId,
        user_id: UserId,
        status: AttendanceStatus,
        excused: bool,
        by: String,
    },

    TokenIssued {
        session_id: SessionId,
        user_id: UserId,
    },

    TokenConsumed {
        session_id: SessionId,
        user_id: UserId,
    },

    TokensExpired { session_id: SessionId, count: usize },

    /// Client connected
    ClientConnected {
        client_id: String,
        role: String,
        uid: Option<u32>,
    },

    /// Client disconnected
    ClientDisconnected { client_id: String },
}

/// Full audit event with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID
    pub id: i64,

    /// Event timestamp
    pub timestamp: DateTime<Local>,

    /// Event type and details
    pub event: AuditEventType,
}

impl AuditEvent {
    pub fn new(event: AuditEventType) -> Self {
        Self {
            id: 0, // Will be set by store
            timestamp: rollcall_util::now(),
            event,
        }
    }
}
