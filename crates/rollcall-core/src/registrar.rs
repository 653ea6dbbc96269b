//! Session registration
//!
//! Exactly one session exists per (meet code, day), however many concurrent
//! submissions race to create it. The unique index is the arbiter: losers
//! of the insert re-read the winner's row.

use chrono::{DateTime, Local, NaiveDate};
use rollcall_config::{RosterMember, Subject};
use rollcall_store::{
    AuditEvent, AuditEventType, ParticipantRecord, SessionFields, SessionRecord, Store, StoreError,
};
use rollcall_util::{MeetCode, Result, RollcallError};
use std::sync::Arc;
use tracing::{debug, info, warn};

const PLACEHOLDER_LENGTH_MINUTES: i64 = 60;

/// Outcome of [`SessionRegistrar::ensure_session`]
#[derive(Debug, Clone)]
pub struct Registration {
    pub session: SessionRecord,
    /// This call inserted the session
    pub created: bool,
    /// This call upgraded a placeholder
    pub refined: bool,
}

/// Schedule-derived fields for a session of `subject` on `day`.
///
/// Without a subject (or without a usable slot that day) the bounds come
/// from what the meeting itself reported: the reported start, else the
/// earliest observation; the reported stop, else the latest observation,
/// else an hour after the start.
pub fn propose_fields(
    subject: Option<&Subject>,
    day: NaiveDate,
    reported_start: Option<DateTime<Local>>,
    reported_stop: Option<DateTime<Local>>,
    earliest_seen: Option<DateTime<Local>>,
    latest_seen: Option<DateTime<Local>>,
    now: DateTime<Local>,
) -> SessionFields {
    let scheduled = subject
        .and_then(|s| s.window_for(day))
        .and_then(|w| w.on_day(day));

    let (start_time, end_time) = match scheduled {
        Some(bounds) => bounds,
        None => {
            let start = reported_start.or(earliest_seen).unwrap_or(now);
            let end = reported_stop
                .or(latest_seen)
                .filter(|end| *end > start)
                .unwrap_or(start + chrono::Duration::minutes(PLACEHOLDER_LENGTH_MINUTES));
            (start, end)
        }
    };

    SessionFields {
        subject_id: subject.map(|s| s.id.clone()),
        is_placeholder: subject.is_none(),
        start_time,
        end_time,
        first_third: start_time + (end_time - start_time) / 3,
        grace_period: subject.is_some_and(|s| s.in_grace_period(day)),
    }
}

pub struct SessionRegistrar {
    store: Arc<dyn Store>,
}

impl SessionRegistrar {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Find or create the session for (meet code, day).
    ///
    /// A new session gets an absent baseline record for every roster member.
    /// An existing placeholder is refined once subject context is known.
    pub fn ensure_session(
        &self,
        meet_code: &MeetCode,
        day: NaiveDate,
        proposed: &SessionFields,
        roster: &[RosterMember],
        now: DateTime<Local>,
    ) -> Result<Registration> {
        if let Some(existing) = self.store.find_session(meet_code, day)? {
            return self.reconcile_existing(existing, proposed, roster, now);
        }

        let session = SessionRecord::new(meet_code.clone(), day, proposed.clone(), now);
        match self.store.insert_session(&session) {
            Ok(()) => {
                info!(
                    session_id = %session.id,
                    meet_code = %meet_code,
                    day = %day,
                    placeholder = proposed.is_placeholder,
                    "Session registered"
                );
                let _ = self.store.append_audit(AuditEvent::new(
                    AuditEventType::SessionRegistered {
                        session_id: session.id,
                        meet_code: meet_code.clone(),
                        day,
                        placeholder: proposed.is_placeholder,
                    },
                ));
                self.baseline(&session, roster, now)?;
                Ok(Registration {
                    session,
                    created: true,
                    refined: false,
                })
            }
            Err(StoreError::Conflict(_)) => {
                debug!(meet_code = %meet_code, day = %day, "Lost session insert race; re-reading");
                let existing = self.store.find_session(meet_code, day)?.ok_or_else(|| {
                    RollcallError::internal(format!(
                        "session {} on {} vanished after conflict",
                        meet_code, day
                    ))
                })?;
                self.reconcile_existing(existing, proposed, roster, now)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn reconcile_existing(
        &self,
        existing: SessionRecord,
        proposed: &SessionFields,
        roster: &[RosterMember],
        now: DateTime<Local>,
    ) -> Result<Registration> {
        if !existing.fields.is_placeholder || proposed.is_placeholder || existing.is_finalized() {
            return Ok(Registration {
                session: existing,
                created: false,
                refined: false,
            });
        }

        let refined = self.store.refine_session(&existing.id, proposed, now)?;
        let session = self
            .store
            .get_session(&existing.id)?
            .ok_or_else(|| RollcallError::SessionNotFound(existing.id.to_string()))?;

        if refined {
            if let Some(subject_id) = &proposed.subject_id {
                info!(
                    session_id = %session.id,
                    subject_id = %subject_id,
                    "Placeholder session refined"
                );
                let _ = self.store.append_audit(AuditEvent::new(
                    AuditEventType::SessionRefined {
                        session_id: session.id,
                        subject_id: subject_id.clone(),
                    },
                ));
            }
            self.baseline(&session, roster, now)?;
        }

        Ok(Registration {
            session,
            created: false,
            refined,
        })
    }

    fn baseline(
        &self,
        session: &SessionRecord,
        roster: &[RosterMember],
        now: DateTime<Local>,
    ) -> Result<()> {
        // Placeholders have no roster of their own
        if session.fields.is_placeholder {
            return Ok(());
        }

        let mut inserted = 0;
        for member in roster {
            let record = ParticipantRecord::baseline(
                session.id,
                member.user_id.clone(),
                member.name.clone(),
                member.student_id.clone(),
                now,
            );
            match self.store.insert_participant_if_absent(&record) {
                Ok(true) => inserted += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        session_id = %session.id,
                        user_id = %member.user_id,
                        error = %e,
                        "Failed to write baseline record"
                    );
                }
            }
        }
        debug!(session_id = %session.id, inserted, "Roster baseline written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rollcall_config::parse_config;
    use rollcall_store::SqliteStore;
    use rollcall_util::UserId;

    const CONFIG: &str = r#"
        config_version = 1

        [[subjects]]
        id = "math-101"
        name = "Calculus I"
        meet_code = "abc-defg-hij"
        add_drop_until = "2024-01-07"

        [[subjects.schedule]]
        days = "weekdays"
        start = "10:00"
        end = "11:00"

        [[subjects.roster]]
        user_id = "stu-1"
        name = "Jane Doe"

        [[subjects.roster]]
        user_id = "stu-2"
        name = "John Doe"
    "#;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 1, 15, h, m, s).unwrap()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
    }

    fn code() -> MeetCode {
        MeetCode::parse("abc-defg-hij").unwrap()
    }

    #[test]
    fn scheduled_fields() {
        let policy = parse_config(CONFIG).unwrap();
        let subject = &policy.subjects[0];

        let fields = propose_fields(Some(subject), day(), None, None, None, None, at(9, 0, 0));
        assert!(!fields.is_placeholder);
        assert_eq!(fields.start_time, at(10, 0, 0));
        assert_eq!(fields.end_time, at(11, 0, 0));
        assert_eq!(fields.first_third, at(10, 20, 0));
        assert!(!fields.grace_period);

        let early = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        let fields = propose_fields(Some(subject), early, None, None, None, None, at(9, 0, 0));
        assert!(fields.grace_period);
    }

    #[test]
    fn placeholder_fields_from_observations() {
        let fields = propose_fields(
            None,
            day(),
            None,
            None,
            Some(at(10, 2, 0)),
            Some(at(10, 2, 0)),
            at(10, 30, 0),
        );
        assert!(fields.is_placeholder);
        assert_eq!(fields.start_time, at(10, 2, 0));
        assert_eq!(fields.end_time, at(11, 2, 0));

        let fields = propose_fields(
            None,
            day(),
            Some(at(9, 0, 0)),
            Some(at(10, 30, 0)),
            None,
            None,
            at(10, 30, 0),
        );
        assert_eq!(fields.end_time, at(10, 30, 0));
        assert_eq!(fields.first_third, at(9, 30, 0));
    }

    #[test]
    fn ensure_session_creates_once_with_baseline() {
        let policy = parse_config(CONFIG).unwrap();
        let subject = &policy.subjects[0];
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let registrar = SessionRegistrar::new(store.clone());
        let fields = propose_fields(Some(subject), day(), None, None, None, None, at(9, 0, 0));

        let first = registrar
            .ensure_session(&code(), day(), &fields, &subject.roster, at(9, 0, 0))
            .unwrap();
        assert!(first.created);

        let second = registrar
            .ensure_session(&code(), day(), &fields, &subject.roster, at(9, 1, 0))
            .unwrap();
        assert!(!second.created);
        assert_eq!(first.session.id, second.session.id);

        let records = store.list_participants(&first.session.id).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| !r.has_joined()));
    }

    #[test]
    fn placeholder_is_refined_once() {
        let policy = parse_config(CONFIG).unwrap();
        let subject = &policy.subjects[0];
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let registrar = SessionRegistrar::new(store.clone());

        let placeholder = propose_fields(None, day(), None, None, Some(at(10, 1, 0)), None, at(10, 1, 0));
        let first = registrar
            .ensure_session(&code(), day(), &placeholder, &[], at(10, 1, 0))
            .unwrap();
        assert!(first.session.fields.is_placeholder);
        assert!(store.list_participants(&first.session.id).unwrap().is_empty());

        let scheduled = propose_fields(Some(subject), day(), None, None, None, None, at(10, 2, 0));
        let refined = registrar
            .ensure_session(&code(), day(), &scheduled, &subject.roster, at(10, 2, 0))
            .unwrap();
        assert!(refined.refined);
        assert_eq!(refined.session.id, first.session.id);
        assert!(!refined.session.fields.is_placeholder);
        assert_eq!(refined.session.fields.start_time, at(10, 0, 0));
        assert!(store
            .get_participant(&first.session.id, &UserId::new("stu-1"))
            .unwrap()
            .is_some());

        let again = registrar
            .ensure_session(&code(), day(), &scheduled, &subject.roster, at(10, 3, 0))
            .unwrap();
        assert!(!again.refined);
    }

    #[test]
    fn concurrent_registration_yields_one_session() {
        let policy = parse_config(CONFIG).unwrap();
        let subject = policy.subjects[0].clone();
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let registrar = Arc::new(SessionRegistrar::new(store.clone()));
        let fields = propose_fields(Some(&subject), day(), None, None, None, None, at(9, 0, 0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registrar = registrar.clone();
                let fields = fields.clone();
                let roster = subject.roster.clone();
                std::thread::spawn(move || {
                    registrar
                        .ensure_session(&code(), day(), &fields, &roster, at(9, 0, 0))
                        .unwrap()
                })
            })
            .collect();

        let results: Vec<Registration> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.created).count(), 1);
        assert!(results.iter().all(|r| r.session.id == results[0].session.id));
        assert_eq!(store.list_participants(&results[0].session.id).unwrap().len(), 2);
    }
}
