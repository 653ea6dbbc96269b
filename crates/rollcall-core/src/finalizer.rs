//! Finalization: settle every open record of a session into its terminal status
//!
//! A pass first closes or synchronizes open presence intervals, then
//! classifies and writes each record with a conditional write, so passes
//! racing on the same session finalize every record exactly once. A
//! storage fault on one record is logged and skipped; the session stays
//! open and the next tick retries what is left.

use chrono::{DateTime, Local};
use rollcall_api::{AttendanceStatus, FinalizeReport, FinalizeTrigger, ParticipantRecordView};
use rollcall_store::{
    AuditEvent, AuditEventType, FinalOutcome, ParticipantRecord, SessionRecord, Store,
};
use rollcall_util::{Result, RollcallError, SessionId, UserId};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    close_open_interval, evaluate, record_view, synchronize, SyncTolerance, TardinessVerdict,
    TokenManager,
};

/// Attempts at a guarded write before giving up on a record
pub(crate) const MAX_WRITE_ATTEMPTS: usize = 3;

/// Terminal status of a settled record.
///
/// Rules, first match wins:
/// 1. never joined: absent
/// 2. left with the meeting, or in it when finalization began with time credited: present
/// 3. returned after leaving, with time credited: late if tardy, else present
/// 4. instructor arrived late and the participant left in the first third: late if tardy, else present
/// 5. did not leave early, with time credited: present
/// 6. otherwise absent
///
/// `open_at_trigger` is whether the record was still in the meeting when
/// the pass started, before its interval was closed.
pub fn classify(
    record: &ParticipantRecord,
    session: &SessionRecord,
    tolerance: SyncTolerance,
    verdict: &TardinessVerdict,
    open_at_trigger: bool,
) -> AttendanceStatus {
    let credited = record.total_duration_secs > 0;
    let tardy_or_present = if verdict.is_tardy {
        AttendanceStatus::Late
    } else {
        AttendanceStatus::Present
    };

    if !record.has_joined() {
        return AttendanceStatus::Absent;
    }

    if record.synchronized || ((record.in_meeting || open_at_trigger) && credited) {
        return AttendanceStatus::Present;
    }

    if record.return_count > 0 && credited {
        return tardy_or_present;
    }

    if verdict.protected {
        return tardy_or_present;
    }

    let left_with_meeting = match (session.instructor_leave, record.last_leave) {
        (Some(end), Some(left)) => left >= end - tolerance.before,
        _ => false,
    };
    let stayed_to_end = record
        .last_leave
        .is_some_and(|left| left >= session.fields.end_time);

    if (left_with_meeting || stayed_to_end) && credited {
        return AttendanceStatus::Present;
    }

    AttendanceStatus::Absent
}

/// Result of one pass
#[derive(Debug, Clone)]
pub struct Finalization {
    pub report: FinalizeReport,
    /// Snapshots of the records finalized in this pass, before finalization
    pub leaving: Vec<ParticipantRecordView>,
    /// The same records after finalization
    pub finalized: Vec<ParticipantRecordView>,
    /// Session as stored after the pass
    pub session: SessionRecord,
}

pub struct Finalizer {
    store: Arc<dyn Store>,
    tokens: Arc<TokenManager>,
    tardy_fraction: f64,
    tolerance: SyncTolerance,
}

impl Finalizer {
    pub fn new(
        store: Arc<dyn Store>,
        tokens: Arc<TokenManager>,
        tardy_fraction: f64,
        tolerance: SyncTolerance,
    ) -> Self {
        Self {
            store,
            tokens,
            tardy_fraction,
            tolerance,
        }
    }

    /// Finalize every open record of the session. Calling this again on a
    /// finalized session changes nothing and reports zero.
    pub fn finalize(
        &self,
        session_id: &SessionId,
        trigger: FinalizeTrigger,
        now: DateTime<Local>,
    ) -> Result<Finalization> {
        let session = self.load_session(session_id)?;
        let mut report = FinalizeReport::empty(session.id, trigger);

        if session.is_finalized() {
            debug!(session_id = %session.id, "Session already finalized");
            return Ok(Finalization {
                report,
                leaving: Vec::new(),
                finalized: Vec::new(),
                session,
            });
        }

        let mut leaving = Vec::new();
        let mut settled = Vec::new();
        for record in self.store.list_participants(&session.id)? {
            if record.finalized {
                continue;
            }
            let open_at_trigger = record.in_meeting;
            match self.settle(&session, record, now) {
                Ok(Some(record)) => {
                    leaving.push(record_view(&record));
                    settled.push((record, open_at_trigger));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "Failed to settle record");
                    report.failed += 1;
                }
            }
        }

        let mut done: HashSet<UserId> = HashSet::new();
        for (record, open_at_trigger) in &settled {
            match self.finalize_record(&session, record, *open_at_trigger, now) {
                Ok(Some(status)) => {
                    report.newly_finalized += 1;
                    match status {
                        AttendanceStatus::Present => report.present += 1,
                        AttendanceStatus::Late => report.late += 1,
                        _ => report.absent += 1,
                    }
                    done.insert(record.user_id.clone());
                }
                Ok(None) => {
                    debug!(
                        session_id = %session.id,
                        user_id = %record.user_id,
                        "Record finalized by a concurrent pass"
                    );
                }
                Err(e) => {
                    warn!(
                        session_id = %session.id,
                        user_id = %record.user_id,
                        error = %e,
                        "Failed to finalize record"
                    );
                    report.failed += 1;
                }
            }
        }
        leaving.retain(|view| done.contains(&view.user_id));

        if report.failed == 0 {
            if self.store.mark_session_finalized(&session.id, now)? {
                report.tokens_expired = self
                    .tokens
                    .expire_for_session(&session.id, now)
                    .unwrap_or_else(|e| {
                        warn!(session_id = %session.id, error = %e, "Failed to expire tokens");
                        0
                    });
            }
        } else {
            warn!(
                session_id = %session.id,
                failed = report.failed,
                "Session left open after partial finalization"
            );
        }

        let _ = self.store.append_audit(AuditEvent::new(AuditEventType::SessionFinalized {
            session_id: session.id,
            trigger,
            newly_finalized: report.newly_finalized,
        }));

        info!(
            session_id = %session.id,
            trigger = ?trigger,
            newly_finalized = report.newly_finalized,
            present = report.present,
            late = report.late,
            absent = report.absent,
            failed = report.failed,
            "Finalization pass complete"
        );

        let finalized = self
            .store
            .list_participants(&session.id)?
            .iter()
            .filter(|r| done.contains(&r.user_id))
            .map(record_view)
            .collect();

        Ok(Finalization {
            report,
            leaving,
            finalized,
            session: self.load_session(session_id)?,
        })
    }

    fn load_session(&self, id: &SessionId) -> Result<SessionRecord> {
        self.store
            .get_session(id)?
            .ok_or_else(|| RollcallError::SessionNotFound(id.to_string()))
    }

    /// Close open intervals: at the meeting end when known, else at the
    /// scheduled end (or now, if earlier). Returns the settled record, or
    /// None if it was finalized concurrently.
    fn settle(
        &self,
        session: &SessionRecord,
        mut record: ParticipantRecord,
        now: DateTime<Local>,
    ) -> Result<Option<ParticipantRecord>> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let mut next = record.clone();
            match session.instructor_leave.filter(|_| session.meeting_ended) {
                Some(end) => {
                    synchronize(&mut next, end, self.tolerance);
                }
                None => {
                    close_open_interval(&mut next, now.min(session.fields.end_time));
                }
            }

            if next == record {
                return Ok(Some(record));
            }
            next.updated_at = now;
            if self.store.advance_participant(&next)? {
                return Ok(Some(next));
            }

            match self.store.get_participant(&record.session_id, &record.user_id)? {
                Some(fresh) if !fresh.finalized => record = fresh,
                _ => return Ok(None),
            }
        }

        Err(RollcallError::StorageConflict(format!(
            "record {} kept changing during finalization",
            record.user_id
        )))
    }

    fn finalize_record(
        &self,
        session: &SessionRecord,
        record: &ParticipantRecord,
        open_at_trigger: bool,
        now: DateTime<Local>,
    ) -> Result<Option<AttendanceStatus>> {
        let verdict = evaluate(session, record, self.tardy_fraction);
        let status = classify(record, session, self.tolerance, &verdict, open_at_trigger);

        // Cumulative for the subject, whether or not this session adds one
        let prior = match &session.fields.subject_id {
            Some(subject_id) => {
                self.store
                    .count_prior_tardies(subject_id, &record.user_id, &session.id)?
            }
            None => 0,
        };

        let outcome = FinalOutcome {
            status,
            is_tardy: verdict.is_tardy,
            tardiness_count: prior + i64::from(verdict.is_tardy),
        };

        if self
            .store
            .finalize_participant(&session.id, &record.user_id, &outcome, now)?
        {
            Ok(Some(status))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use rollcall_api::SessionStatus;
    use rollcall_store::{SessionFields, SqliteStore, StoreError, StoreResult, TokenRecord};
    use rollcall_util::{MeetCode, SessionId, SubjectId};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 1, 15, h, m, s).unwrap()
    }

    fn tolerance() -> SyncTolerance {
        SyncTolerance {
            before: chrono::Duration::milliseconds(100),
            after: chrono::Duration::milliseconds(1000),
        }
    }

    fn session() -> SessionRecord {
        SessionRecord::new(
            MeetCode::parse("abc-defg-hij").unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            SessionFields {
                subject_id: None,
                is_placeholder: false,
                start_time: at(10, 0, 0),
                end_time: at(11, 0, 0),
                first_third: at(10, 20, 0),
                grace_period: false,
            },
            at(9, 0, 0),
        )
    }

    fn record(user: &str) -> ParticipantRecord {
        ParticipantRecord::baseline(
            SessionId::new(),
            UserId::new(user),
            user,
            None,
            at(9, 0, 0),
        )
    }

    fn verdict(is_tardy: bool, protected: bool) -> TardinessVerdict {
        TardinessVerdict {
            is_tardy,
            time_to_enter_secs: Some(0),
            protected,
        }
    }

    #[test]
    fn classification_rules() {
        let mut s = session();
        s.instructor_leave = Some(at(10, 58, 0));
        s.meeting_ended = true;

        let never = record("a");
        assert_eq!(classify(&never, &s, tolerance(), &verdict(false, false), false), AttendanceStatus::Absent);

        let mut synced = record("b");
        synced.first_join = Some(at(10, 5, 0));
        synced.synchronized = true;
        synced.total_duration_secs = 3180;
        assert_eq!(classify(&synced, &s, tolerance(), &verdict(true, false), false), AttendanceStatus::Present);

        let mut returned = record("c");
        returned.first_join = Some(at(10, 20, 0));
        returned.last_leave = Some(at(10, 40, 0));
        returned.return_count = 1;
        returned.total_duration_secs = 900;
        assert_eq!(classify(&returned, &s, tolerance(), &verdict(true, false), false), AttendanceStatus::Late);
        assert_eq!(classify(&returned, &s, tolerance(), &verdict(false, false), false), AttendanceStatus::Present);

        let mut early = record("d");
        early.first_join = Some(at(10, 5, 0));
        early.last_leave = Some(at(10, 10, 0));
        early.total_duration_secs = 300;
        assert_eq!(classify(&early, &s, tolerance(), &verdict(false, false), false), AttendanceStatus::Absent);
        assert_eq!(classify(&early, &s, tolerance(), &verdict(false, true), false), AttendanceStatus::Present);

        let mut stayed = record("e");
        stayed.first_join = Some(at(10, 5, 0));
        stayed.last_leave = Some(at(11, 0, 30));
        stayed.total_duration_secs = 3300;
        assert_eq!(classify(&stayed, &s, tolerance(), &verdict(false, false), false), AttendanceStatus::Present);
    }

    fn setup() -> (Arc<dyn Store>, Finalizer, SessionRecord) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let tokens = Arc::new(TokenManager::new(
            store.clone(),
            chrono::Duration::minutes(15),
            chrono::Duration::minutes(30),
        ));
        let finalizer = Finalizer::new(store.clone(), tokens, 0.25, tolerance());
        let s = session();
        store.insert_session(&s).unwrap();
        (store, finalizer, s)
    }

    fn seed(store: &Arc<dyn Store>, s: &SessionRecord, user: &str, join: Option<DateTime<Local>>) {
        let mut r = ParticipantRecord::baseline(s.id, UserId::new(user), user, None, at(9, 0, 0));
        r.first_join = join;
        r.in_meeting = join.is_some();
        store.insert_participant_if_absent(&r).unwrap();
    }

    #[test]
    fn finalize_after_meeting_end_is_idempotent() {
        let (store, finalizer, s) = setup();
        seed(&store, &s, "stu-1", Some(at(10, 5, 0)));
        seed(&store, &s, "stu-2", None);
        store.mark_meeting_ended(&s.id, at(10, 58, 0), at(10, 58, 0)).unwrap();

        let first = finalizer
            .finalize(&s.id, FinalizeTrigger::InstructorLeft, at(10, 58, 1))
            .unwrap();
        assert_eq!(first.report.newly_finalized, 2);
        assert_eq!(first.report.present, 1);
        assert_eq!(first.report.absent, 1);
        assert_eq!(first.leaving.len(), 2);
        assert!(first.finalized.iter().all(|v| v.finalized));
        assert!(first.session.is_finalized());

        let jane = store
            .get_participant(&s.id, &UserId::new("stu-1"))
            .unwrap()
            .unwrap();
        assert_eq!(jane.status, AttendanceStatus::Present);
        assert_eq!(jane.total_duration_secs, 3180);
        assert!(jane.synchronized);

        let second = finalizer
            .finalize(&s.id, FinalizeTrigger::InstructorLeft, at(10, 59, 0))
            .unwrap();
        assert_eq!(second.report.newly_finalized, 0);
        assert!(second.finalized.is_empty());
    }

    #[test]
    fn timeout_closes_open_intervals_at_scheduled_end() {
        let (store, finalizer, s) = setup();
        seed(&store, &s, "stu-1", Some(at(10, 30, 0)));

        let done = finalizer
            .finalize(&s.id, FinalizeTrigger::Timeout, at(11, 45, 0))
            .unwrap();
        assert_eq!(done.report.present, 1);

        let r = store
            .get_participant(&s.id, &UserId::new("stu-1"))
            .unwrap()
            .unwrap();
        assert_eq!(r.total_duration_secs, 1800);
        assert_eq!(r.last_leave, Some(at(11, 0, 0)));
        assert!(!r.synchronized);
    }

    #[test]
    fn tardy_record_counts_prior_tardies() {
        let (store, finalizer, _) = setup();
        let subject = rollcall_util::SubjectId::new("math-101");

        let finalize_day = |day: u32| {
            let start = Local.with_ymd_and_hms(2024, 1, day, 10, 0, 0).unwrap();
            let s = SessionRecord::new(
                MeetCode::parse("abc-defg-hij").unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
                SessionFields {
                    subject_id: Some(subject.clone()),
                    is_placeholder: false,
                    start_time: start,
                    end_time: start + chrono::Duration::hours(1),
                    first_third: start + chrono::Duration::minutes(20),
                    grace_period: false,
                },
                start,
            );
            store.insert_session(&s).unwrap();
            let mut r = ParticipantRecord::baseline(s.id, UserId::new("stu-1"), "Jane", None, start);
            r.first_join = Some(start + chrono::Duration::minutes(30));
            r.in_meeting = true;
            store.insert_participant_if_absent(&r).unwrap();
            finalizer
                .finalize(&s.id, FinalizeTrigger::Timeout, start + chrono::Duration::hours(2))
                .unwrap();
            store.get_participant(&s.id, &UserId::new("stu-1")).unwrap().unwrap()
        };

        let first = finalize_day(16);
        assert!(first.is_tardy);
        assert_eq!(first.tardiness_count, 1);

        let second = finalize_day(17);
        assert_eq!(second.tardiness_count, 2);
    }

    /// SQLite store whose terminal write for one user fails while `broken` is set
    struct FlakyStore {
        inner: SqliteStore,
        user: UserId,
        broken: AtomicBool,
    }

    impl Store for FlakyStore {
        fn find_session(&self, meet_code: &MeetCode, day: NaiveDate) -> StoreResult<Option<SessionRecord>> {
            self.inner.find_session(meet_code, day)
        }
        fn get_session(&self, id: &SessionId) -> StoreResult<Option<SessionRecord>> {
            self.inner.get_session(id)
        }
        fn insert_session(&self, session: &SessionRecord) -> StoreResult<()> {
            self.inner.insert_session(session)
        }
        fn refine_session(&self, id: &SessionId, fields: &SessionFields, now: DateTime<Local>) -> StoreResult<bool> {
            self.inner.refine_session(id, fields, now)
        }
        fn advance_session_status(&self, id: &SessionId, status: SessionStatus, now: DateTime<Local>) -> StoreResult<bool> {
            self.inner.advance_session_status(id, status, now)
        }
        fn set_instructor_join(&self, id: &SessionId, join: DateTime<Local>, late: bool, now: DateTime<Local>) -> StoreResult<bool> {
            self.inner.set_instructor_join(id, join, late, now)
        }
        fn mark_meeting_ended(&self, id: &SessionId, leave: DateTime<Local>, now: DateTime<Local>) -> StoreResult<bool> {
            self.inner.mark_meeting_ended(id, leave, now)
        }
        fn push_unmatched(&self, id: &SessionId, names: &[String], capacity: usize, now: DateTime<Local>) -> StoreResult<()> {
            self.inner.push_unmatched(id, names, capacity, now)
        }
        fn mark_session_finalized(&self, id: &SessionId, now: DateTime<Local>) -> StoreResult<bool> {
            self.inner.mark_session_finalized(id, now)
        }
        fn list_open_sessions(&self) -> StoreResult<Vec<SessionRecord>> {
            self.inner.list_open_sessions()
        }
        fn get_participant(&self, session_id: &SessionId, user_id: &UserId) -> StoreResult<Option<ParticipantRecord>> {
            self.inner.get_participant(session_id, user_id)
        }
        fn list_participants(&self, session_id: &SessionId) -> StoreResult<Vec<ParticipantRecord>> {
            self.inner.list_participants(session_id)
        }
        fn insert_participant_if_absent(&self, record: &ParticipantRecord) -> StoreResult<bool> {
            self.inner.insert_participant_if_absent(record)
        }
        fn advance_participant(&self, record: &ParticipantRecord) -> StoreResult<bool> {
            self.inner.advance_participant(record)
        }
        fn finalize_participant(
            &self,
            session_id: &SessionId,
            user_id: &UserId,
            outcome: &FinalOutcome,
            now: DateTime<Local>,
        ) -> StoreResult<bool> {
            if *user_id == self.user && self.broken.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("database is locked".into()));
            }
            self.inner.finalize_participant(session_id, user_id, outcome, now)
        }
        fn override_participant(
            &self,
            session_id: &SessionId,
            user_id: &UserId,
            status: AttendanceStatus,
            excused: bool,
            by: &str,
            now: DateTime<Local>,
        ) -> StoreResult<bool> {
            self.inner.override_participant(session_id, user_id, status, excused, by, now)
        }
        fn count_prior_tardies(&self, subject_id: &SubjectId, user_id: &UserId, excluding: &SessionId) -> StoreResult<i64> {
            self.inner.count_prior_tardies(subject_id, user_id, excluding)
        }
        fn find_token(&self, token: &str) -> StoreResult<Option<TokenRecord>> {
            self.inner.find_token(token)
        }
        fn find_token_for(&self, session_id: &SessionId, user_id: &UserId) -> StoreResult<Option<TokenRecord>> {
            self.inner.find_token_for(session_id, user_id)
        }
        fn insert_token(&self, token: &TokenRecord) -> StoreResult<()> {
            self.inner.insert_token(token)
        }
        fn delete_token(&self, token: &str) -> StoreResult<bool> {
            self.inner.delete_token(token)
        }
        fn consume_token(&self, token: &str, by: &str, now: DateTime<Local>) -> StoreResult<bool> {
            self.inner.consume_token(token, by, now)
        }
        fn expire_tokens_for_session(&self, session_id: &SessionId, now: DateTime<Local>) -> StoreResult<usize> {
            self.inner.expire_tokens_for_session(session_id, now)
        }
        fn append_audit(&self, event: AuditEvent) -> StoreResult<()> {
            self.inner.append_audit(event)
        }
        fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>> {
            self.inner.get_recent_audits(limit)
        }
        fn is_healthy(&self) -> bool {
            self.inner.is_healthy()
        }
    }

    #[test]
    fn failed_record_leaves_session_open_for_retry() {
        let flaky = Arc::new(FlakyStore {
            inner: SqliteStore::in_memory().unwrap(),
            user: UserId::new("stu-2"),
            broken: AtomicBool::new(true),
        });
        let store: Arc<dyn Store> = flaky.clone();
        let tokens = Arc::new(TokenManager::new(
            store.clone(),
            chrono::Duration::minutes(15),
            chrono::Duration::minutes(30),
        ));
        let finalizer = Finalizer::new(store.clone(), tokens, 0.25, tolerance());
        let s = session();
        store.insert_session(&s).unwrap();
        seed(&store, &s, "stu-1", Some(at(10, 30, 0)));
        seed(&store, &s, "stu-2", Some(at(10, 5, 0)));

        let partial = finalizer
            .finalize(&s.id, FinalizeTrigger::Timeout, at(11, 45, 0))
            .unwrap();
        assert_eq!(partial.report.failed, 1);
        assert_eq!(partial.report.newly_finalized, 1);
        assert_eq!(partial.finalized.len(), 1);
        assert_eq!(partial.finalized[0].user_id, UserId::new("stu-1"));
        assert!(!partial.session.is_finalized());

        let stuck = store
            .get_participant(&s.id, &UserId::new("stu-2"))
            .unwrap()
            .unwrap();
        assert!(!stuck.finalized);

        flaky.broken.store(false, Ordering::SeqCst);
        let retry = finalizer
            .finalize(&s.id, FinalizeTrigger::Timeout, at(11, 50, 0))
            .unwrap();
        assert_eq!(retry.report.failed, 0);
        assert_eq!(retry.report.newly_finalized, 1);
        assert_eq!(retry.report.present, 1);
        assert!(retry.session.is_finalized());

        let settled = store
            .get_participant(&s.id, &UserId::new("stu-2"))
            .unwrap()
            .unwrap();
        assert!(settled.finalized);
        assert_eq!(settled.status, AttendanceStatus::Present);
        assert_eq!(settled.total_duration_secs, 3300);
    }

    #[test]
    fn in_meeting_record_is_present_when_forced_before_end() {
        let (store, finalizer, s) = setup();
        seed(&store, &s, "stu-1", Some(at(10, 5, 0)));

        let done = finalizer
            .finalize(&s.id, FinalizeTrigger::Manual, at(10, 30, 0))
            .unwrap();
        assert_eq!(done.report.present, 1);

        let r = store
            .get_participant(&s.id, &UserId::new("stu-1"))
            .unwrap()
            .unwrap();
        assert_eq!(r.status, AttendanceStatus::Present);
        assert_eq!(r.total_duration_secs, 1500);
        assert!(!r.in_meeting);
    }
}
