//! Tardiness evaluation

use chrono::{DateTime, Local};
use rollcall_store::{ParticipantRecord, SessionRecord};

/// Tardiness facts for one record in one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TardinessVerdict {
    pub is_tardy: bool,
    /// Seconds from scheduled start to first join, clamped at zero
    pub time_to_enter_secs: Option<i64>,
    /// Instructor arrived late and the participant left before the first
    /// third of the slot; an absence outcome is not allowed
    pub protected: bool,
}

/// Whether a first join at `joined` is tardy for the slot `[start, end)`.
///
/// Compared in milliseconds: tardy when strictly more than `fraction` of the
/// scheduled duration has elapsed.
pub fn is_tardy(
    start: DateTime<Local>,
    end: DateTime<Local>,
    joined: DateTime<Local>,
    fraction: f64,
) -> bool {
    let scheduled_ms = (end - start).num_milliseconds();
    if scheduled_ms <= 0 {
        return false;
    }
    let elapsed_ms = (joined - start).num_milliseconds();
    elapsed_ms as f64 > fraction * scheduled_ms as f64
}

pub fn evaluate(
    session: &SessionRecord,
    record: &ParticipantRecord,
    fraction: f64,
) -> TardinessVerdict {
    let Some(joined) = record.first_join else {
        return TardinessVerdict {
            is_tardy: false,
            time_to_enter_secs: None,
            protected: false,
        };
    };

    let fields = &session.fields;
    let time_to_enter = (joined - fields.start_time).num_seconds().max(0);
    let is_tardy =
        !fields.grace_period && is_tardy(fields.start_time, fields.end_time, joined, fraction);
    let protected = session.instructor_late
        && record
            .last_leave
            .is_some_and(|left| left < fields.first_third);

    TardinessVerdict {
        is_tardy,
        time_to_enter_secs: Some(time_to_enter),
        protected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use rollcall_store::SessionFields;
    use rollcall_util::{MeetCode, SessionId, UserId};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 1, 15, h, m, s).unwrap()
    }

    fn session(grace_period: bool) -> SessionRecord {
        SessionRecord::new(
            MeetCode::parse("abc-defg-hij").unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            SessionFields {
                subject_id: None,
                is_placeholder: false,
                start_time: at(10, 0, 0),
                end_time: at(11, 0, 0),
                first_third: at(10, 20, 0),
                grace_period,
            },
            at(9, 0, 0),
        )
    }

    fn joined_at(join: DateTime<Local>) -> ParticipantRecord {
        let mut r = ParticipantRecord::baseline(
            SessionId::new(),
            UserId::new("stu-1"),
            "Jane Doe",
            None,
            at(9, 0, 0),
        );
        r.first_join = Some(join);
        r
    }

    #[test]
    fn quarter_boundary() {
        let s = session(false);

        let v = evaluate(&s, &joined_at(at(10, 14, 59)), 0.25);
        assert!(!v.is_tardy);
        assert_eq!(v.time_to_enter_secs, Some(899));

        let v = evaluate(&s, &joined_at(at(10, 15, 0)), 0.25);
        assert!(!v.is_tardy);

        let v = evaluate(&s, &joined_at(at(10, 15, 1)), 0.25);
        assert!(v.is_tardy);
        assert_eq!(v.time_to_enter_secs, Some(901));
    }

    #[test]
    fn early_join_has_zero_time_to_enter() {
        let v = evaluate(&session(false), &joined_at(at(9, 55, 0)), 0.25);
        assert!(!v.is_tardy);
        assert_eq!(v.time_to_enter_secs, Some(0));
    }

    #[test]
    fn grace_period_suppresses_tardiness() {
        let v = evaluate(&session(true), &joined_at(at(10, 40, 0)), 0.25);
        assert!(!v.is_tardy);
    }

    #[test]
    fn instructor_late_protection() {
        let mut s = session(false);
        let mut r = joined_at(at(10, 5, 0));
        r.last_leave = Some(at(10, 12, 0));

        assert!(!evaluate(&s, &r, 0.25).protected);

        s.instructor_late = true;
        assert!(evaluate(&s, &r, 0.25).protected);

        r.last_leave = Some(at(10, 25, 0));
        assert!(!evaluate(&s, &r, 0.25).protected);
    }

    #[test]
    fn never_joined() {
        let r = ParticipantRecord::baseline(
            SessionId::new(),
            UserId::new("stu-1"),
            "Jane Doe",
            None,
            at(9, 0, 0),
        );
        let v = evaluate(&session(false), &r, 0.25);
        assert!(!v.is_tardy);
        assert_eq!(v.time_to_enter_secs, None);
    }
}
