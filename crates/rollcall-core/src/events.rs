//! Core events emitted by the engine

use chrono::{DateTime, Local};
use rollcall_api::{FinalizeTrigger, ParticipantRecordView, StatusTransition};
use rollcall_store::ParticipantRecord;
use rollcall_util::{MeetCode, SessionId};

/// Events emitted by the core engine, in the order they must be published
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// Records were written
    AttendanceSaved {
        session_id: SessionId,
        meet_code: MeetCode,
        transition: Option<StatusTransition>,
        /// Only finalized snapshots are ground truth
        authoritative: bool,
        records: Vec<ParticipantRecordView>,
    },

    /// Live presence from a progress ping; nothing final
    AttendanceProgress {
        session_id: SessionId,
        meet_code: MeetCode,
        records: Vec<ParticipantRecordView>,
    },

    /// Meeting over and records finalized
    MeetingEnded {
        session_id: SessionId,
        meet_code: MeetCode,
        trigger: FinalizeTrigger,
        instructor_leave: Option<DateTime<Local>>,
        finalized: usize,
    },
}

impl CoreEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            CoreEvent::AttendanceSaved { session_id, .. }
            | CoreEvent::AttendanceProgress { session_id, .. }
            | CoreEvent::MeetingEnded { session_id, .. } => *session_id,
        }
    }

    pub fn is_finalized_snapshot(&self) -> bool {
        matches!(
            self,
            CoreEvent::AttendanceSaved {
                transition: Some(StatusTransition::Finalized),
                authoritative: true,
                ..
            }
        )
    }
}

/// Outbound view of a stored record
pub fn record_view(record: &ParticipantRecord) -> ParticipantRecordView {
    ParticipantRecordView {
        user_id: record.user_id.clone(),
        display_name: record.display_name.clone(),
        student_id: record.student_id.clone(),
        status: record.status,
        join_time: record.first_join,
        leave_time: record.last_leave,
        duration_seconds: record.total_duration_secs,
        is_tardy: record.is_tardy,
        tardiness_count: record.tardiness_count,
        time_to_enter_seconds: record.time_to_enter_secs,
        leave_count: record.leave_count,
        return_count: record.return_count,
        in_meeting: record.in_meeting,
        synchronized: record.synchronized,
        finalized: record.finalized,
        excused: record.excused,
    }
}
