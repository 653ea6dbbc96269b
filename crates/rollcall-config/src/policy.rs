//! Validated policy structures

use crate::schema::{
    RawConfig, RawEngineConfig, RawInstructor, RawMember, RawServiceConfig, RawSubject,
    RawTimeWindow,
};
use crate::validation::{parse_date, parse_days, parse_time};
use chrono::{Datelike, NaiveDate};
use rollcall_util::{DaysOfWeek, MeetCode, SubjectId, TimeWindow, UserId, WallClock};
use std::path::PathBuf;
use std::time::Duration;

/// Validated policy ready for use by the engine
#[derive(Debug, Clone, Default)]
pub struct Policy {
    /// Service configuration
    pub service: ServiceConfig,

    /// Reconciliation tunables
    pub engine: EngineSettings,

    /// Subject catalog
    pub subjects: Vec<Subject>,
}

impl Policy {
    /// Convert from raw config (after validation)
    pub fn from_raw(raw: RawConfig) -> Self {
        Self {
            service: ServiceConfig::from_raw(raw.service),
            engine: EngineSettings::from_raw(raw.engine),
            subjects: raw.subjects.into_iter().map(Subject::from_raw).collect(),
        }
    }

    /// Get subject by ID
    pub fn get_subject(&self, id: &SubjectId) -> Option<&Subject> {
        self.subjects.iter().find(|s| &s.id == id)
    }

    /// Get the subject that owns a standing meet code
    pub fn subject_for_meet_code(&self, code: &MeetCode) -> Option<&Subject> {
        self.subjects
            .iter()
            .find(|s| s.meet_code.as_ref() == Some(code))
    }
}

/// Service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub socket_path: PathBuf,
    pub log_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl ServiceConfig {
    fn from_raw(raw: RawServiceConfig) -> Self {
        Self {
            socket_path: raw
                .socket_path
                .unwrap_or_else(rollcall_util::default_socket_path),
            log_dir: raw.log_dir.unwrap_or_else(rollcall_util::default_log_dir),
            data_dir: raw.data_dir.unwrap_or_else(rollcall_util::default_data_dir),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::from_raw(RawServiceConfig::default())
    }
}

/// Engine tunables
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub tardy_fraction: f64,
    /// How long before the instructor's leave a participant may have left and still be synchronized
    pub sync_tolerance_before: Duration,
    /// How long after the instructor's leave a participant's leave still counts as synchronized
    pub sync_tolerance_after: Duration,
    pub finalize_timeout: Duration,
    pub token_lead: Duration,
    pub token_grace: Duration,
    pub unmatched_log_capacity: usize,
    pub require_token: bool,
    pub live_cache_ttl: Duration,
    pub live_cache_max_entries: usize,
    pub finalized_republish_delay: Duration,
    pub tick_interval: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tardy_fraction: 0.25,
            sync_tolerance_before: Duration::from_millis(100),
            sync_tolerance_after: Duration::from_millis(1000),
            finalize_timeout: Duration::from_secs(30 * 60),
            token_lead: Duration::from_secs(15 * 60),
            token_grace: Duration::from_secs(30 * 60),
            unmatched_log_capacity: 50,
            require_token: false,
            live_cache_ttl: Duration::from_secs(300),
            live_cache_max_entries: 1024,
            finalized_republish_delay: Duration::from_millis(2000),
            tick_interval: Duration::from_secs(30),
        }
    }
}

impl EngineSettings {
    fn from_raw(raw: RawEngineConfig) -> Self {
        let d = Self::default();
        Self {
            tardy_fraction: raw.tardy_fraction.unwrap_or(d.tardy_fraction),
            sync_tolerance_before: raw
                .sync_tolerance_before_ms
                .map(Duration::from_millis)
                .unwrap_or(d.sync_tolerance_before),
            sync_tolerance_after: raw
                .sync_tolerance_after_ms
                .map(Duration::from_millis)
                .unwrap_or(d.sync_tolerance_after),
            finalize_timeout: raw
                .finalize_timeout_minutes
                .map(minutes)
                .unwrap_or(d.finalize_timeout),
            token_lead: raw.token_lead_minutes.map(minutes).unwrap_or(d.token_lead),
            token_grace: raw.token_grace_minutes.map(minutes).unwrap_or(d.token_grace),
            unmatched_log_capacity: raw
                .unmatched_log_capacity
                .unwrap_or(d.unmatched_log_capacity),
            require_token: raw.require_token.unwrap_or(d.require_token),
            live_cache_ttl: raw
                .live_cache_ttl_seconds
                .map(Duration::from_secs)
                .unwrap_or(d.live_cache_ttl),
            live_cache_max_entries: raw
                .live_cache_max_entries
                .unwrap_or(d.live_cache_max_entries),
            finalized_republish_delay: raw
                .finalized_republish_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(d.finalized_republish_delay),
            tick_interval: raw
                .tick_interval_seconds
                .map(Duration::from_secs)
                .unwrap_or(d.tick_interval),
        }
    }
}

fn minutes(m: u64) -> Duration {
    Duration::from_secs(m * 60)
}

/// Validated subject definition
#[derive(Debug, Clone)]
pub struct Subject {
    pub id: SubjectId,
    pub name: String,
    pub meet_code: Option<MeetCode>,
    pub schedule: Vec<TimeWindow>,
    /// Last day (inclusive) of the add/drop grace period
    pub add_drop_until: Option<NaiveDate>,
    pub instructor: Option<Instructor>,
    pub roster: Vec<RosterMember>,
}

impl Subject {
    fn from_raw(raw: RawSubject) -> Self {
        Self {
            id: SubjectId::new(raw.id),
            name: raw.name,
            meet_code: raw.meet_code.as_deref().and_then(MeetCode::parse),
            schedule: raw.schedule.into_iter().map(convert_time_window).collect(),
            add_drop_until: raw.add_drop_until.as_deref().and_then(|s| parse_date(s).ok()),
            instructor: raw.instructor.map(Instructor::from_raw),
            roster: raw.roster.into_iter().map(RosterMember::from_raw).collect(),
        }
    }

    /// Class slot for a given day: the one recurring on that weekday,
    /// else the first slot (make-up days)
    pub fn window_for(&self, day: NaiveDate) -> Option<&TimeWindow> {
        self.schedule
            .iter()
            .find(|w| w.occurs_on(day))
            .or_else(|| self.schedule.first())
    }

    /// Sessions on or before the last add/drop day carry no tardiness penalty
    pub fn in_grace_period(&self, day: NaiveDate) -> bool {
        self.add_drop_until.is_some_and(|until| day <= until)
    }

    pub fn is_enrolled(&self, user_id: &UserId) -> bool {
        self.roster.iter().any(|m| &m.user_id == user_id)
    }

    pub fn member(&self, user_id: &UserId) -> Option<&RosterMember> {
        self.roster.iter().find(|m| &m.user_id == user_id)
    }

    /// Whether this subject holds class on the given weekday
    pub fn meets_on(&self, day: NaiveDate) -> bool {
        self.schedule.iter().any(|w| w.days.contains(day.weekday()))
    }
}

/// Designated instructor
#[derive(Debug, Clone)]
pub struct Instructor {
    pub user_id: Option<UserId>,
    pub name: String,
    pub email: Option<String>,
    pub staff_id: Option<String>,
}

impl Instructor {
    fn from_raw(raw: RawInstructor) -> Self {
        Self {
            user_id: raw.user_id.map(UserId::new),
            name: raw.name,
            email: raw.email,
            staff_id: raw.staff_id,
        }
    }
}

/// Enrolled student as known to the roster
#[derive(Debug, Clone)]
pub struct RosterMember {
    pub user_id: UserId,
    pub name: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub student_id: Option<String>,
    pub student_id_verified: bool,
}

impl RosterMember {
    fn from_raw(raw: RawMember) -> Self {
        Self {
            user_id: UserId::new(raw.user_id),
            name: raw.name,
            email: raw.email,
            email_verified: raw.email_verified,
            student_id: raw.student_id,
            student_id_verified: raw.student_id_verified,
        }
    }
}

fn convert_time_window(raw: RawTimeWindow) -> TimeWindow {
    let days_mask = parse_days(&raw.days).unwrap_or(0x7F);
    let (start_h, start_m) = parse_time(&raw.start).unwrap_or((0, 0));
    let (end_h, end_m) = parse_time(&raw.end).unwrap_or((23, 59));

    TimeWindow::new(
        DaysOfWeek::new(days_mask),
        WallClock::new(start_h, start_m).unwrap_or(WallClock { hour: 0, minute: 0 }),
        WallClock::new(end_h, end_m).unwrap_or(WallClock { hour: 23, minute: 59 }),
    )
}
