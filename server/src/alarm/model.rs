use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Days, LocalResult, NaiveDateTime, NaiveTime, TimeZone, Timelike};
use thiserror::Error;

/// Local time-of-day picked by the user. Seconds are always zero.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct AlarmTime(NaiveTime);

#[derive(Debug, Error, Eq, PartialEq)]
pub enum AlarmTimeError {
    #[error("invalid alarm time '{0}', expected HH:MM")]
    Format(String),
    #[error("alarm time {hour}:{minute} is out of range")]
    OutOfRange { hour: u32, minute: u32 },
}

impl AlarmTime {
    pub fn new(hour: u32, minute: u32) -> Result<Self, AlarmTimeError> {
        NaiveTime::from_hms_opt(hour, minute, 0)
            .map(Self)
            .ok_or(AlarmTimeError::OutOfRange { hour, minute })
    }

    pub fn hour(self) -> u32 {
        self.0.hour()
    }

    pub fn minute(self) -> u32 {
        self.0.minute()
    }

    pub fn as_naive_time(self) -> NaiveTime {
        self.0
    }
}

impl FromStr for AlarmTime {
    type Err = AlarmTimeError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        let parsed = NaiveTime::parse_from_str(trimmed, "%H:%M")
            .map_err(|_| AlarmTimeError::Format(trimmed.to_string()))?;
        Self::new(parsed.hour(), parsed.minute())
    }
}

impl fmt::Display for AlarmTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

/// The single "fire at T" intent owned by the scheduler.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct AlarmRequest {
    pub target_timestamp_ms: i64,
}

impl AlarmRequest {
    /// Accepts a SET_ALARM timestamp only when it lies strictly after `now_ms`.
    pub fn accept(timestamp: Option<i64>, now_ms: i64) -> Option<Self> {
        let target_timestamp_ms = timestamp?;
        (target_timestamp_ms > now_ms).then_some(Self {
            target_timestamp_ms,
        })
    }

    pub fn is_due(&self, now_ms: i64) -> bool {
        now_ms >= self.target_timestamp_ms
    }

    pub fn delay_from(&self, now_ms: i64) -> Duration {
        let remaining = self.target_timestamp_ms.saturating_sub(now_ms).max(0);
        Duration::from_millis(u64::try_from(remaining).unwrap_or(0))
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum TimeDisplayMode {
    #[default]
    Hour24,
    Hour12,
}

fn resolve_local_datetime<Tz>(timezone: &Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    match timezone.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt),
        LocalResult::Ambiguous(first, _second) => Some(first),
        LocalResult::None => None,
    }
}

/// Next instant strictly after `now` whose local wall clock reads `time`.
///
/// Today is tried first, then the following day. A local time that falls in a
/// DST gap is skipped to the next day on which it exists; an ambiguous one
/// resolves to its first occurrence.
pub fn next_alarm_in_tz<Tz>(
    time: AlarmTime,
    now: &DateTime<Tz>,
    timezone: &Tz,
) -> Option<DateTime<Tz>>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    for day_offset in 0_u64..3 {
        let date = now.date_naive().checked_add_days(Days::new(day_offset))?;
        let naive = date.and_time(time.as_naive_time());
        let candidate = match resolve_local_datetime(timezone, naive) {
            Some(value) => value,
            None => continue,
        };

        if candidate > *now {
            return Some(candidate);
        }
    }

    None
}

pub fn format_clock<Tz>(now: &DateTime<Tz>, mode: TimeDisplayMode) -> String
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    match mode {
        TimeDisplayMode::Hour24 => now.format("%H:%M:%S").to_string(),
        TimeDisplayMode::Hour12 => {
            let (is_pm, hour12) = now.hour12();
            let meridiem = if is_pm { "PM" } else { "AM" };
            format!(
                "{}:{:02}:{:02} {}",
                hour12,
                now.minute(),
                now.second(),
                meridiem
            )
        }
    }
}

pub fn format_countdown(remaining: chrono::Duration) -> String {
    let total = remaining.num_seconds().max(0);
    format!(
        "{:02}:{:02}:{:02}",
        total / 3_600,
        (total % 3_600) / 60,
        total % 60
    )
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone};
    use chrono_tz::America::New_York;

    use super::*;

    fn at(
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        minute: u32,
        second: u32,
    ) -> DateTime<chrono_tz::Tz> {
        New_York
            .with_ymd_and_hms(year, month, day, hour, minute, second)
            .single()
            .expect("valid local time")
    }

    #[test]
    fn parses_hour_minute_input() {
        let time: AlarmTime = "07:05".parse().expect("valid time");
        assert_eq!(time.hour(), 7);
        assert_eq!(time.minute(), 5);
        assert_eq!(time.to_string(), "07:05");
    }

    #[test]
    fn rejects_out_of_range_and_garbage_input() {
        assert!(matches!(
            "25:00".parse::<AlarmTime>(),
            Err(AlarmTimeError::Format(_))
        ));
        assert!(matches!(
            "7am".parse::<AlarmTime>(),
            Err(AlarmTimeError::Format(_))
        ));
        assert!(matches!(
            AlarmTime::new(23, 60),
            Err(AlarmTimeError::OutOfRange {
                hour: 23,
                minute: 60
            })
        ));
    }

    #[test]
    fn later_time_today_fires_same_day() {
        let now = at(2026, 6, 10, 23, 58, 0);
        let time = AlarmTime::new(23, 59).expect("valid");
        let next = next_alarm_in_tz(time, &now, &New_York).expect("next");
        assert_eq!(next, at(2026, 6, 10, 23, 59, 0));
    }

    #[test]
    fn earlier_time_rolls_to_tomorrow() {
        let now = at(2026, 6, 10, 9, 0, 0);
        let time = AlarmTime::new(8, 0).expect("valid");
        let next = next_alarm_in_tz(time, &now, &New_York).expect("next");
        assert_eq!(next, at(2026, 6, 11, 8, 0, 0));
    }

    #[test]
    fn current_minute_is_not_strictly_future() {
        let exact = at(2026, 6, 10, 8, 0, 0);
        let time = AlarmTime::new(8, 0).expect("valid");
        let next = next_alarm_in_tz(time, &exact, &New_York).expect("next");
        assert_eq!(next, at(2026, 6, 11, 8, 0, 0));

        let mid_minute = at(2026, 6, 10, 8, 0, 30);
        let next = next_alarm_in_tz(time, &mid_minute, &New_York).expect("next");
        assert_eq!(next, at(2026, 6, 11, 8, 0, 0));
    }

    #[test]
    fn resolved_instant_is_never_past_and_within_a_day() {
        let now = at(2026, 1, 15, 12, 34, 56);
        for hour in 0..24 {
            for minute in [0, 17, 34, 35, 59] {
                let time = AlarmTime::new(hour, minute).expect("valid");
                let next = next_alarm_in_tz(time, &now, &New_York).expect("next");
                assert!(next > now);
                assert!(next - now <= chrono::Duration::hours(24));
            }
        }
    }

    #[test]
    fn dst_spring_forward_gap_moves_to_next_day() {
        let now = at(2026, 3, 8, 0, 30, 0);
        let time = AlarmTime::new(2, 30).expect("valid");
        let next = next_alarm_in_tz(time, &now, &New_York).expect("next");
        assert_eq!(
            next.date_naive(),
            NaiveDate::from_ymd_opt(2026, 3, 9).expect("valid date")
        );
    }

    #[test]
    fn dst_fall_back_chooses_first_ambiguous_instance() {
        let now = at(2026, 11, 1, 0, 0, 0);
        let time = AlarmTime::new(1, 30).expect("valid");
        let naive = NaiveDate::from_ymd_opt(2026, 11, 1)
            .expect("date")
            .and_time(time.as_naive_time());
        let expected = match New_York.from_local_datetime(&naive) {
            LocalResult::Ambiguous(first, _second) => first,
            _ => panic!("expected ambiguous local time"),
        };

        let actual = next_alarm_in_tz(time, &now, &New_York).expect("next");
        assert_eq!(actual, expected);
    }

    #[test]
    fn request_acceptance_requires_future_timestamp() {
        assert_eq!(
            AlarmRequest::accept(Some(1_001), 1_000),
            Some(AlarmRequest {
                target_timestamp_ms: 1_001
            })
        );
        assert_eq!(AlarmRequest::accept(Some(1_000), 1_000), None);
        assert_eq!(AlarmRequest::accept(Some(10), 1_000), None);
        assert_eq!(AlarmRequest::accept(None, 1_000), None);
    }

    #[test]
    fn delay_saturates_at_zero() {
        let request = AlarmRequest {
            target_timestamp_ms: 5_000,
        };
        assert_eq!(request.delay_from(3_500), Duration::from_millis(1_500));
        assert_eq!(request.delay_from(9_000), Duration::ZERO);
    }

    #[test]
    fn countdown_and_clock_formatting() {
        assert_eq!(
            format_countdown(chrono::Duration::seconds(3_725)),
            "01:02:05"
        );
        assert_eq!(format_countdown(chrono::Duration::seconds(-4)), "00:00:00");

        let afternoon = at(2026, 6, 10, 15, 4, 9);
        assert_eq!(format_clock(&afternoon, TimeDisplayMode::Hour24), "15:04:09");
        assert_eq!(format_clock(&afternoon, TimeDisplayMode::Hour12), "3:04:09 PM");
    }

    #[test]
    fn request_is_due_from_its_target_onwards() {
        let request = AlarmRequest::accept(Some(2_000), 1_000).expect("future");
        assert!(!request.is_due(1_999));
        assert!(request.is_due(2_000));
        assert!(request.is_due(9_000));
    }
}
