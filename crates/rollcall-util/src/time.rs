//! Time utilities for rollcall
//!
//! Everything the engine reasons about is wall-clock time in the local zone:
//! scraped join/leave stamps, class schedules, token validity windows.
//!
//! # Mock Time for Development
//!
//! In debug builds, the `ROLLCALL_MOCK_TIME` environment variable can be set
//! to override the system time for all time-sensitive operations (timeout
//! finalization, token windows). Mock time advances at the real rate.
//!
//! Format: `YYYY-MM-DD HH:MM:SS` (e.g., `2024-01-01 11:31:00`)

use chrono::{
    DateTime, Datelike, Local, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, TimeZone,
    Timelike, Weekday,
};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

/// Environment variable name for mock time (debug builds only)
pub const MOCK_TIME_ENV_VAR: &str = "ROLLCALL_MOCK_TIME";

/// Offset between mock time and real time, computed once at first use.
static MOCK_TIME_OFFSET: OnceLock<Option<chrono::Duration>> = OnceLock::new();

#[allow(clippy::disallowed_methods)]
fn get_mock_time_offset() -> Option<chrono::Duration> {
    *MOCK_TIME_OFFSET.get_or_init(|| {
        #[cfg(debug_assertions)]
        {
            let raw = std::env::var(MOCK_TIME_ENV_VAR).ok()?;
            let Ok(naive) = NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S") else {
                tracing::warn!(
                    mock_time = %raw,
                    expected_format = "%Y-%m-%d %H:%M:%S",
                    "Invalid mock time format"
                );
                return None;
            };
            let Some(mock_dt) = Local.from_local_datetime(&naive).single() else {
                tracing::warn!(mock_time = %raw, "Failed to convert mock time to local timezone");
                return None;
            };
            let offset = mock_dt.signed_duration_since(chrono::Local::now());
            tracing::info!(
                mock_time = %raw,
                offset_secs = offset.num_seconds(),
                "Mock time enabled"
            );
            Some(offset)
        }
        #[cfg(not(debug_assertions))]
        {
            None
        }
    })
}

/// Get the current local time, respecting mock time settings in debug builds.
#[allow(clippy::disallowed_methods)]
pub fn now() -> DateTime<Local> {
    let real_now = chrono::Local::now();
    match get_mock_time_offset() {
        Some(offset) => real_now + offset,
        None => real_now,
    }
}

/// Anchor a naive local date and time in the local zone.
///
/// Ambiguous instants (DST fall-back) resolve to the earlier one; instants
/// inside a DST gap return None.
pub fn local_datetime(day: NaiveDate, time: NaiveTime) -> Option<DateTime<Local>> {
    Local.from_local_datetime(&day.and_time(time)).earliest()
}

/// Format a timestamp for storage and the wire: RFC 3339 with millisecond precision.
pub fn format_timestamp(dt: &DateTime<Local>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, false)
}

/// Parse a timestamp previously written by [`format_timestamp`].
pub fn parse_timestamp(s: &str) -> Option<DateTime<Local>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Local))
}

/// Format a calendar day key (`YYYY-MM-DD`).
pub fn format_day(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

/// Parse a calendar day key (`YYYY-MM-DD`).
pub fn parse_day(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

/// Wall-clock time of day used in class schedules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WallClock {
    pub hour: u8,
    pub minute: u8,
}

impl WallClock {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        if hour < 24 && minute < 60 {
            Some(Self { hour, minute })
        } else {
            None
        }
    }

    pub fn to_naive_time(self) -> NaiveTime {
        // hour/minute are range-checked at construction
        NaiveTime::from_hms_opt(self.hour as u32, self.minute as u32, 0).unwrap_or(NaiveTime::MIN)
    }

    pub fn from_naive_time(time: NaiveTime) -> Self {
        Self {
            hour: time.hour() as u8,
            minute: time.minute() as u8,
        }
    }

    /// Returns seconds since midnight
    pub fn as_seconds_from_midnight(&self) -> u32 {
        (self.hour as u32) * 3600 + (self.minute as u32) * 60
    }
}

impl PartialOrd for WallClock {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WallClock {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_seconds_from_midnight()
            .cmp(&other.as_seconds_from_midnight())
    }
}

/// Days of the week mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DaysOfWeek(u8);

impl DaysOfWeek {
    pub const MONDAY: u8 = 1 << 0;
    pub const TUESDAY: u8 = 1 << 1;
    pub const WEDNESDAY: u8 = 1 << 2;
    pub const THURSDAY: u8 = 1 << 3;
    pub const FRIDAY: u8 = 1 << 4;
    pub const SATURDAY: u8 = 1 << 5;
    pub const SUNDAY: u8 = 1 << 6;

    pub const WEEKDAYS: DaysOfWeek = DaysOfWeek(
        Self::MONDAY | Self::TUESDAY | Self::WEDNESDAY | Self::THURSDAY | Self::FRIDAY,
    );
    pub const ALL_DAYS: DaysOfWeek = DaysOfWeek(0x7F);
    pub const NONE: DaysOfWeek = DaysOfWeek(0);

    pub fn new(mask: u8) -> Self {
        Self(mask & 0x7F)
    }

    pub fn contains(&self, weekday: Weekday) -> bool {
        let bit = match weekday {
            Weekday::Mon => Self::MONDAY,
            Weekday::Tue => Self::TUESDAY,
            Weekday::Wed => Self::WEDNESDAY,
            Weekday::Thu => Self::THURSDAY,
            Weekday::Fri => Self::FRIDAY,
            Weekday::Sat => Self::SATURDAY,
            Weekday::Sun => Self::SUNDAY,
        };
        (self.0 & bit) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// A recurring class slot: on these days, from `start` to `end`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub days: DaysOfWeek,
    pub start: WallClock,
    pub end: WallClock,
}

impl TimeWindow {
    pub fn new(days: DaysOfWeek, start: WallClock, end: WallClock) -> Self {
        Self { days, start, end }
    }

    /// Whether this slot recurs on the given calendar day
    pub fn occurs_on(&self, day: NaiveDate) -> bool {
        self.days.contains(day.weekday())
    }

    /// Concrete start/end instants of this slot on the given day.
    ///
    /// Returns None when either instant falls into a DST gap or the slot is empty.
    pub fn on_day(&self, day: NaiveDate) -> Option<(DateTime<Local>, DateTime<Local>)> {
        if self.start >= self.end {
            return None;
        }
        let start = local_datetime(day, self.start.to_naive_time())?;
        let end = local_datetime(day, self.end.to_naive_time())?;
        Some((start, end))
    }

    /// Scheduled length of the slot
    pub fn length(&self) -> Duration {
        let start = self.start.as_seconds_from_midnight();
        let end = self.end.as_seconds_from_midnight();
        Duration::from_secs(end.saturating_sub(start) as u64)
    }
}

/// Helper to format durations in human-readable form
pub fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wall_clock_ordering() {
        let morning = WallClock::new(8, 0).unwrap();
        let noon = WallClock::new(12, 0).unwrap();
        assert!(morning < noon);
        assert!(WallClock::new(24, 0).is_none());
        assert!(WallClock::new(10, 60).is_none());
    }

    #[test]
    fn test_days_of_week() {
        let weekdays = DaysOfWeek::WEEKDAYS;
        assert!(weekdays.contains(Weekday::Mon));
        assert!(weekdays.contains(Weekday::Fri));
        assert!(!weekdays.contains(Weekday::Sat));
        assert!(DaysOfWeek::NONE.is_empty());
    }

    #[test]
    fn test_window_on_day() {
        let window = TimeWindow::new(
            DaysOfWeek::new(DaysOfWeek::MONDAY),
            WallClock::new(10, 0).unwrap(),
            WallClock::new(11, 0).unwrap(),
        );

        // 2024-01-01 is a Monday
        let monday = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let tuesday = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        assert!(window.occurs_on(monday));
        assert!(!window.occurs_on(tuesday));

        let (start, end) = window.on_day(monday).unwrap();
        assert_eq!(start, Local.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap());
        assert_eq!(end - start, chrono::Duration::hours(1));
        assert_eq!(window.length(), Duration::from_secs(3600));
    }

    #[test]
    fn test_timestamp_keeps_milliseconds() {
        let dt = Local.with_ymd_and_hms(2024, 1, 1, 10, 58, 0).unwrap()
            - chrono::Duration::milliseconds(50);
        let parsed = parse_timestamp(&format_timestamp(&dt)).unwrap();
        assert_eq!(parsed, dt);
    }

    #[test]
    fn test_day_keys() {
        let day = parse_day("2024-01-01").unwrap();
        assert_eq!(format_day(day), "2024-01-01");
        assert!(parse_day("01/01/2024").is_none());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3180)), "53m 0s");
    }

    #[test]
    fn test_now_advances() {
        let t1 = now();
        std::thread::sleep(Duration::from_millis(20));
        let t2 = now();
        assert!(t2 > t1);
    }
}
