//! Realtime event types for rollcalld -> dashboard streaming
//!
//! Only `attendance:update` events with `statusTransition: finalized` and
//! `authoritative: true` are ground truth; everything else is UI continuity.

use chrono::{DateTime, Local};
use rollcall_util::{MeetCode, SessionId};
use serde::{Deserialize, Serialize};

use crate::{FinalizeTrigger, ParticipantRecordView, StatusTransition, API_VERSION};

/// Event envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub api_version: u32,
    pub timestamp: DateTime<Local>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            api_version: API_VERSION,
            timestamp: rollcall_util::now(),
            payload,
        }
    }

    /// Whether consumers may treat this event as final
    pub fn is_authoritative(&self) -> bool {
        matches!(&self.payload, EventPayload::AttendanceUpdate(u) if u.authoritative)
    }
}

/// All possible events from the service to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum EventPayload {
    #[serde(rename = "attendance:update")]
    AttendanceUpdate(AttendanceUpdate),

    #[serde(rename = "meeting:ended")]
    MeetingEnded(MeetingEnded),

    /// Service is shutting down
    #[serde(rename = "service:shutdown")]
    Shutdown,
}

/// Kind of attendance update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    AttendanceSaved,
    AttendanceProgress,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceUpdate {
    #[serde(rename = "type")]
    pub kind: UpdateKind,
    pub session_id: SessionId,
    pub meet_code: MeetCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_transition: Option<StatusTransition>,
    pub authoritative: bool,
    pub records: Vec<ParticipantRecordView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingEnded {
    pub session_id: SessionId,
    pub meet_code: MeetCode,
    pub trigger: FinalizeTrigger,
    pub instructor_leave_time: Option<DateTime<Local>>,
    pub finalized: usize,
}
