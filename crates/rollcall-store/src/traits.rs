//! Store trait definitions
//!
//! Every mutating call that can race is a conditional write: it reports
//! whether it applied instead of failing, and callers re-read on `false`.

use chrono::{DateTime, Local, NaiveDate};
use rollcall_api::{AttendanceStatus, SessionStatus};
use rollcall_util::{MeetCode, SessionId, SubjectId, UserId};

use crate::{
    AuditEvent, FinalOutcome, ParticipantRecord, SessionFields, SessionRecord, StoreResult,
    TokenRecord,
};

/// Main store trait
pub trait Store: Send + Sync {
    // Sessions

    fn find_session(
        &self,
        meet_code: &MeetCode,
        day: NaiveDate,
    ) -> StoreResult<Option<SessionRecord>>;

    fn get_session(&self, id: &SessionId) -> StoreResult<Option<SessionRecord>>;

    /// Insert a new session. Fails with `StoreError::Conflict` if the
    /// (meet code, day) key already exists.
    fn insert_session(&self, session: &SessionRecord) -> StoreResult<()>;

    /// Upgrade a placeholder session. No-op (returns false) if the session is
    /// already complete.
    fn refine_session(
        &self,
        id: &SessionId,
        fields: &SessionFields,
        now: DateTime<Local>,
    ) -> StoreResult<bool>;

    /// Move the status forward. No-op if the stored status already ranks at
    /// or above `status`.
    fn advance_session_status(
        &self,
        id: &SessionId,
        status: SessionStatus,
        now: DateTime<Local>,
    ) -> StoreResult<bool>;

    /// Record the instructor's join. Ignored once the meeting has ended.
    fn set_instructor_join(
        &self,
        id: &SessionId,
        join: DateTime<Local>,
        late: bool,
        now: DateTime<Local>,
    ) -> StoreResult<bool>;

    /// Mark the meeting ended at the instructor's leave. Only the first call applies.
    fn mark_meeting_ended(
        &self,
        id: &SessionId,
        instructor_leave: DateTime<Local>,
        now: DateTime<Local>,
    ) -> StoreResult<bool>;

    /// Append to the bounded unmatched-name log, dropping the oldest beyond `capacity`
    fn push_unmatched(
        &self,
        id: &SessionId,
        names: &[String],
        capacity: usize,
        now: DateTime<Local>,
    ) -> StoreResult<()>;

    /// Stamp the session finalized and completed. Only the first call applies.
    fn mark_session_finalized(&self, id: &SessionId, now: DateTime<Local>) -> StoreResult<bool>;

    /// Sessions not yet finalized
    fn list_open_sessions(&self) -> StoreResult<Vec<SessionRecord>>;

    // Participant records

    fn get_participant(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
    ) -> StoreResult<Option<ParticipantRecord>>;

    fn list_participants(&self, session_id: &SessionId) -> StoreResult<Vec<ParticipantRecord>>;

    /// Insert unless a record for (session, user) exists. Returns whether it inserted.
    fn insert_participant_if_absent(&self, record: &ParticipantRecord) -> StoreResult<bool>;

    /// Compare-and-advance write. Applies only if the stored record is not
    /// finalized and its duration and leave/return counters do not exceed
    /// the new values. `first_join` is never overwritten once set.
    fn advance_participant(&self, record: &ParticipantRecord) -> StoreResult<bool>;

    /// Write terminal values. Only applies to a record not yet finalized.
    fn finalize_participant(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
        outcome: &FinalOutcome,
        now: DateTime<Local>,
    ) -> StoreResult<bool>;

    /// Administrative change of a finalized record
    fn override_participant(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
        status: AttendanceStatus,
        excused: bool,
        by: &str,
        now: DateTime<Local>,
    ) -> StoreResult<bool>;

    /// Finalized, non-excused tardy records of this user in other
    /// non-grace-period sessions of the subject
    fn count_prior_tardies(
        &self,
        subject_id: &SubjectId,
        user_id: &UserId,
        excluding: &SessionId,
    ) -> StoreResult<i64>;

    // Tokens

    fn find_token(&self, token: &str) -> StoreResult<Option<TokenRecord>>;

    fn find_token_for(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
    ) -> StoreResult<Option<TokenRecord>>;

    /// Fails with `StoreError::Conflict` if the token string or the
    /// (session, user) pair already has a token
    fn insert_token(&self, token: &TokenRecord) -> StoreResult<()>;

    fn delete_token(&self, token: &str) -> StoreResult<bool>;

    /// Mark consumed. Returns false if it was already consumed (or missing).
    fn consume_token(&self, token: &str, by: &str, now: DateTime<Local>) -> StoreResult<bool>;

    /// Mark every token of the session expired, then remove them. Returns the count removed.
    fn expire_tokens_for_session(
        &self,
        session_id: &SessionId,
        now: DateTime<Local>,
    ) -> StoreResult<usize>;

    // Audit log

    /// Append an audit event
    fn append_audit(&self, event: AuditEvent) -> StoreResult<()>;

    /// Get recent audit events
    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>>;

    // Health

    /// Check if store is healthy
    fn is_healthy(&self) -> bool;
}
