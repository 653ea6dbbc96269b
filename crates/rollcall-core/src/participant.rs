//! Participant presence state machine
//!
//! ```text
//! NotJoined --join--> InMeeting --leave--> Left --join (after leave)--> InMeeting
//!                         |                  |
//!                         +---- meeting end (instructor leave) ----+--> Synchronized
//! ```
//!
//! Observations may arrive late, duplicated or out of order. Every transition
//! here is a pure function of the stored record and one timestamp, so
//! replaying an observation leaves the record unchanged.

use chrono::{DateTime, Local};
use rollcall_api::{SubmissionWarning, WarningCode, WarningSeverity};
use rollcall_store::ParticipantRecord;
use tracing::trace;

use crate::Observation;

/// Window around the instructor's leave within which a participant's own
/// leave counts as leaving with the meeting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncTolerance {
    pub before: chrono::Duration,
    pub after: chrono::Duration,
}

impl SyncTolerance {
    pub fn from_settings(settings: &rollcall_config::EngineSettings) -> Self {
        Self {
            before: crate::span(settings.sync_tolerance_before),
            after: crate::span(settings.sync_tolerance_after),
        }
    }
}

/// Derived presence state of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    NotJoined,
    InMeeting,
    /// Left; a later join counts as a return
    Left,
    /// Left together with the instructor
    Synchronized,
    Finalized,
}

pub fn presence_state(record: &ParticipantRecord) -> PresenceState {
    if record.finalized {
        PresenceState::Finalized
    } else if record.synchronized {
        PresenceState::Synchronized
    } else if record.in_meeting {
        PresenceState::InMeeting
    } else if record.has_joined() {
        PresenceState::Left
    } else {
        PresenceState::NotJoined
    }
}

/// Result of synchronizing a record with the meeting end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Still in the meeting; open interval closed at the meeting end
    ClosedAtEnd,
    /// Own leave fell within tolerance of the meeting end
    WithinTolerance,
    /// Left before the tolerance window
    LeftEarly,
    /// Left after the tolerance window
    LeftAfter,
    NotJoined,
    Unchanged,
}

impl SyncOutcome {
    pub fn is_synchronized(&self) -> bool {
        matches!(self, SyncOutcome::ClosedAtEnd | SyncOutcome::WithinTolerance)
    }
}

/// Apply one observation. Returns warnings for rows that could not be applied.
pub fn apply_observation(
    record: &mut ParticipantRecord,
    obs: &Observation,
) -> Vec<SubmissionWarning> {
    let mut warnings = Vec::new();
    if record.finalized {
        return warnings;
    }

    match (obs.join, obs.leave) {
        (Some(join), Some(leave)) if leave <= join => {
            warnings.push(non_positive(&obs.name, join, leave));
            apply_join(record, join);
        }
        (join, leave) => {
            if let Some(join) = join {
                apply_join(record, join);
            }
            if let Some(leave) = leave
                && let Some(warning) = apply_leave(record, leave, &obs.name)
            {
                warnings.push(warning);
            }
        }
    }

    if let Some(reported) = obs.reported_secs {
        apply_reported(record, reported);
    }

    warnings
}

/// Join (or return). The first join is immutable; a join after the last
/// leave is a return; anything else is a replay.
pub fn apply_join(record: &mut ParticipantRecord, at: DateTime<Local>) -> bool {
    if record.finalized {
        return false;
    }

    if record.first_join.is_none() {
        record.first_join = Some(at);
        record.in_meeting = true;
        return true;
    }

    if record.in_meeting {
        return false;
    }

    match record.last_leave {
        Some(left) if at > left => {
            record.return_count += 1;
            record.last_return = Some(at);
            record.in_meeting = true;
            true
        }
        _ => {
            trace!(user_id = %record.user_id, at = %at, "Stale join ignored");
            false
        }
    }
}

/// Leave. Credits the interval since the join (or last return) when it is
/// positive; a non-positive interval is dropped with a warning.
pub fn apply_leave(
    record: &mut ParticipantRecord,
    at: DateTime<Local>,
    name: &str,
) -> Option<SubmissionWarning> {
    if record.finalized || !record.in_meeting {
        // Leave without a join, or a replay of the last leave
        return None;
    }

    let anchor = record.last_return.or(record.first_join)?;
    if at <= anchor {
        // A stale leave from before the latest return is a replay
        if record.last_return.is_some() {
            return None;
        }
        return Some(non_positive(name, anchor, at));
    }

    credit(record, at - anchor);
    record.last_leave = Some(at);
    record.leave_count += 1;
    record.in_meeting = false;
    None
}

/// Raise the duration to a scraper-reported cumulative value. Never lowers it.
pub fn apply_reported(record: &mut ParticipantRecord, reported_secs: i64) {
    if reported_secs > record.total_duration_secs {
        record.total_duration_secs = reported_secs;
    }
}

/// Propagate the meeting end at `end` to one record.
pub fn synchronize(
    record: &mut ParticipantRecord,
    end: DateTime<Local>,
    tolerance: SyncTolerance,
) -> SyncOutcome {
    if record.finalized || record.synchronized {
        return SyncOutcome::Unchanged;
    }
    let Some(first_join) = record.first_join else {
        return SyncOutcome::NotJoined;
    };

    if record.in_meeting {
        let anchor = record.last_return.unwrap_or(first_join);
        if anchor >= end {
            return SyncOutcome::Unchanged;
        }
        credit(record, end - anchor);
        record.last_leave = Some(end);
        record.in_meeting = false;
        record.synchronized = true;
        return SyncOutcome::ClosedAtEnd;
    }

    let Some(left) = record.last_leave else {
        return SyncOutcome::Unchanged;
    };

    if left < end - tolerance.before {
        SyncOutcome::LeftEarly
    } else if left > end + tolerance.after {
        SyncOutcome::LeftAfter
    } else {
        if left < end {
            credit(record, end - left);
        }
        record.last_leave = Some(end);
        record.synchronized = true;
        SyncOutcome::WithinTolerance
    }
}

/// Close an open interval at `at` without marking the record synchronized.
/// Used when a session times out with no observed meeting end.
pub fn close_open_interval(record: &mut ParticipantRecord, at: DateTime<Local>) -> bool {
    if record.finalized || !record.in_meeting {
        return false;
    }
    let Some(anchor) = record.last_return.or(record.first_join) else {
        return false;
    };
    if at <= anchor {
        return false;
    }
    credit(record, at - anchor);
    record.last_leave = Some(at);
    record.in_meeting = false;
    true
}

fn credit(record: &mut ParticipantRecord, span: chrono::Duration) {
    if span <= chrono::Duration::zero() {
        return;
    }
    record.credited_secs += span.num_seconds();
    record.total_duration_secs = record.total_duration_secs.max(record.credited_secs);
}

fn non_positive(name: &str, from: DateTime<Local>, to: DateTime<Local>) -> SubmissionWarning {
    SubmissionWarning::new(
        WarningSeverity::Warn,
        WarningCode::NonPositiveInterval,
        format!(
            "leave at {} is not after join at {}; interval dropped",
            to.format("%H:%M:%S"),
            from.format("%H:%M:%S")
        ),
    )
    .for_participant(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rollcall_util::{SessionId, UserId};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 1, 15, h, m, s).unwrap()
    }

    fn record() -> ParticipantRecord {
        ParticipantRecord::baseline(
            SessionId::new(),
            UserId::new("stu-1"),
            "Jane Doe",
            None,
            at(9, 0, 0),
        )
    }

    fn obs(join: Option<DateTime<Local>>, leave: Option<DateTime<Local>>) -> Observation {
        let mut o = Observation::named("Jane Doe");
        o.join = join;
        o.leave = leave;
        o
    }

    fn tolerance() -> SyncTolerance {
        SyncTolerance {
            before: chrono::Duration::milliseconds(100),
            after: chrono::Duration::milliseconds(1000),
        }
    }

    #[test]
    fn join_then_leave_credits_interval() {
        let mut r = record();
        assert_eq!(presence_state(&r), PresenceState::NotJoined);

        assert!(apply_observation(&mut r, &obs(Some(at(10, 5, 0)), None)).is_empty());
        assert_eq!(presence_state(&r), PresenceState::InMeeting);

        assert!(apply_observation(&mut r, &obs(Some(at(10, 5, 0)), Some(at(10, 10, 0)))).is_empty());
        assert_eq!(presence_state(&r), PresenceState::Left);
        assert_eq!(r.total_duration_secs, 300);
        assert_eq!(r.leave_count, 1);
        assert_eq!(r.first_join, Some(at(10, 5, 0)));
    }

    #[test]
    fn replay_is_a_no_op() {
        let mut r = record();
        let o = obs(Some(at(10, 5, 0)), Some(at(10, 10, 0)));
        apply_observation(&mut r, &o);
        let snapshot = r.clone();

        apply_observation(&mut r, &o);
        apply_observation(&mut r, &obs(Some(at(10, 5, 0)), None));
        assert_eq!(r, snapshot);
    }

    #[test]
    fn first_join_is_immutable() {
        let mut r = record();
        apply_join(&mut r, at(10, 5, 0));
        assert!(!apply_join(&mut r, at(10, 1, 0)));
        assert_eq!(r.first_join, Some(at(10, 5, 0)));
    }

    #[test]
    fn return_after_leave() {
        let mut r = record();
        apply_observation(&mut r, &obs(Some(at(10, 5, 0)), Some(at(10, 10, 0))));
        apply_observation(&mut r, &obs(Some(at(10, 20, 0)), None));

        assert_eq!(r.return_count, 1);
        assert_eq!(r.last_return, Some(at(10, 20, 0)));
        assert!(r.in_meeting);

        // The old leave arriving again does not close the new interval
        apply_observation(&mut r, &obs(None, Some(at(10, 10, 0))));
        assert!(r.in_meeting);

        apply_observation(&mut r, &obs(None, Some(at(10, 30, 0))));
        assert_eq!(r.total_duration_secs, 300 + 600);
        assert_eq!(r.leave_count, 2);
    }

    #[test]
    fn join_before_last_leave_is_not_a_return() {
        let mut r = record();
        apply_observation(&mut r, &obs(Some(at(10, 5, 0)), Some(at(10, 10, 0))));
        assert!(!apply_join(&mut r, at(10, 8, 0)));
        assert_eq!(r.return_count, 0);
    }

    #[test]
    fn non_positive_interval_is_dropped() {
        let mut r = record();
        let warnings = apply_observation(&mut r, &obs(Some(at(10, 10, 0)), Some(at(10, 5, 0))));

        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].code, WarningCode::NonPositiveInterval);
        assert_eq!(warnings[0].participant.as_deref(), Some("Jane Doe"));
        assert_eq!(r.total_duration_secs, 0);
        assert_eq!(r.leave_count, 0);
        assert!(r.in_meeting);
    }

    #[test]
    fn reported_duration_is_a_floor() {
        let mut r = record();
        let mut o = obs(Some(at(10, 5, 0)), None);
        o.reported_secs = Some(180);
        apply_observation(&mut r, &o);
        assert_eq!(r.total_duration_secs, 180);

        // Closing the interval does not add the reported time on top
        apply_observation(&mut r, &obs(None, Some(at(10, 10, 0))));
        assert_eq!(r.total_duration_secs, 300);

        // A smaller report never lowers it
        let mut o = obs(None, None);
        o.reported_secs = Some(60);
        apply_observation(&mut r, &o);
        assert_eq!(r.total_duration_secs, 300);
    }

    #[test]
    fn synchronize_closes_open_interval() {
        let mut r = record();
        apply_join(&mut r, at(10, 5, 0));

        let outcome = synchronize(&mut r, at(10, 58, 0), tolerance());
        assert_eq!(outcome, SyncOutcome::ClosedAtEnd);
        assert_eq!(r.total_duration_secs, 3180);
        assert_eq!(r.last_leave, Some(at(10, 58, 0)));
        assert_eq!(r.leave_count, 0);
        assert!(r.synchronized);
        assert_eq!(presence_state(&r), PresenceState::Synchronized);

        // Second propagation is a no-op
        assert_eq!(synchronize(&mut r, at(10, 58, 0), tolerance()), SyncOutcome::Unchanged);
        assert_eq!(r.total_duration_secs, 3180);
    }

    #[test]
    fn synchronize_tolerance_boundaries() {
        let end = at(10, 58, 0);
        let left_at = |offset_ms: i64| {
            let mut r = record();
            apply_join(&mut r, at(10, 5, 0));
            apply_leave(&mut r, end + chrono::Duration::milliseconds(offset_ms), "Jane Doe");
            let outcome = synchronize(&mut r, end, tolerance());
            (outcome, r)
        };

        let (outcome, r) = left_at(-50);
        assert_eq!(outcome, SyncOutcome::WithinTolerance);
        assert!(r.synchronized);
        assert_eq!(r.last_leave, Some(end));

        let (outcome, r) = left_at(-500);
        assert_eq!(outcome, SyncOutcome::LeftEarly);
        assert!(!r.synchronized);

        let (outcome, _) = left_at(1000);
        assert_eq!(outcome, SyncOutcome::WithinTolerance);

        let (outcome, r) = left_at(2000);
        assert_eq!(outcome, SyncOutcome::LeftAfter);
        assert!(!r.synchronized);
    }

    #[test]
    fn never_joined_is_not_synchronized() {
        let mut r = record();
        assert_eq!(synchronize(&mut r, at(10, 58, 0), tolerance()), SyncOutcome::NotJoined);
        assert!(!r.synchronized);
    }

    #[test]
    fn close_open_interval_on_timeout() {
        let mut r = record();
        apply_join(&mut r, at(10, 30, 0));
        assert!(close_open_interval(&mut r, at(11, 0, 0)));
        assert_eq!(r.total_duration_secs, 1800);
        assert!(!r.synchronized);
        assert!(!close_open_interval(&mut r, at(11, 0, 0)));
    }

    #[test]
    fn finalized_records_are_frozen() {
        let mut r = record();
        r.finalized = true;
        assert!(!apply_join(&mut r, at(10, 5, 0)));
        assert_eq!(presence_state(&r), PresenceState::Finalized);
    }
}
