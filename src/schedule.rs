//! Schedule descriptions and the triggers they compile into
//!
//! A [`ScheduleInfo`] says when a pipeline should run. Compiling it yields a
//! [`Trigger`], which only answers "when is the next fire after this instant".
//! The timer engine works purely in terms of triggers.
//!
//! # Example
//!
//! ```
//! use databridge::schedule::ScheduleInfo;
//! use chrono::{TimeZone, Utc};
//!
//! let schedule: ScheduleInfo = serde_yaml::from_str("interval: { minutes: 15 }").unwrap();
//! let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 7, 30).unwrap();
//! let trigger = schedule.compile(now).unwrap();
//!
//! // first fire on the next whole minute, then every 15 minutes
//! let fires = trigger.upcoming(now, 2);
//! assert_eq!(fires[0], Utc.with_ymd_and_hms(2024, 1, 1, 10, 8, 0).unwrap());
//! assert_eq!(fires[1], Utc.with_ymd_and_hms(2024, 1, 1, 10, 23, 0).unwrap());
//! ```

use crate::error::{BridgeError, Result};
use chrono::{DateTime, Datelike, Days, Duration, Local, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

/// When a pipeline runs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleInfo {
    /// Cron expression with seconds (sec min hour day month dayofweek [year])
    Cron { expression: String },
    /// Fixed offset, repeating forever from the next whole minute
    Interval {
        #[serde(default)]
        days: u32,
        #[serde(default)]
        hours: u32,
        #[serde(default)]
        minutes: u32,
        #[serde(default)]
        seconds: u32,
    },
    /// Given weekdays at a local time of day
    Daily { days: Vec<Weekday>, time: NaiveTime },
}

impl ScheduleInfo {
    pub fn cron(expression: impl Into<String>) -> Self {
        ScheduleInfo::Cron {
            expression: expression.into(),
        }
    }

    pub fn every_minutes(minutes: u32) -> Self {
        ScheduleInfo::Interval {
            days: 0,
            hours: 0,
            minutes,
            seconds: 0,
        }
    }

    pub fn daily(days: Vec<Weekday>, time: NaiveTime) -> Self {
        ScheduleInfo::Daily { days, time }
    }

    /// Check the description without compiling it
    pub fn validate(&self) -> Result<()> {
        match self {
            ScheduleInfo::Cron { expression } => parse_cron(expression).map(|_| ()),
            ScheduleInfo::Interval { .. } => self.interval().map(|_| ()),
            ScheduleInfo::Daily { days, .. } => {
                if days.is_empty() {
                    return Err(BridgeError::InvalidSchedule(
                        "daily schedule needs at least one weekday".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Compile into a trigger. `now` anchors interval schedules.
    pub fn compile(&self, now: DateTime<Utc>) -> Result<Arc<dyn Trigger>> {
        self.validate()?;
        Ok(match self {
            ScheduleInfo::Cron { expression } => Arc::new(CronTrigger {
                expression: expression.clone(),
                schedule: parse_cron(expression)?,
            }),
            ScheduleInfo::Interval { .. } => Arc::new(IntervalTrigger {
                anchor: next_even_minute(now),
                every: self.interval()?,
            }),
            ScheduleInfo::Daily { days, time } => Arc::new(DailyTrigger {
                days: distinct_days(days),
                time: *time,
            }),
        })
    }

    fn interval(&self) -> Result<Duration> {
        let ScheduleInfo::Interval {
            days,
            hours,
            minutes,
            seconds,
        } = self
        else {
            return Err(BridgeError::State("not an interval schedule".to_string()));
        };
        let total = i64::from(*days) * 86_400
            + i64::from(*hours) * 3_600
            + i64::from(*minutes) * 60
            + i64::from(*seconds);
        if total <= 0 {
            return Err(BridgeError::InvalidSchedule(
                "interval must be longer than zero".to_string(),
            ));
        }
        Ok(Duration::seconds(total))
    }
}

impl std::fmt::Display for ScheduleInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleInfo::Cron { expression } => write!(f, "cron '{}'", expression),
            ScheduleInfo::Interval {
                days,
                hours,
                minutes,
                seconds,
            } => write!(f, "every {}d {}h {}m {}s", days, hours, minutes, seconds),
            ScheduleInfo::Daily { days, time } => {
                let days: Vec<String> = days.iter().map(|d| d.to_string()).collect();
                write!(f, "daily on {} at {}", days.join(","), time)
            }
        }
    }
}

/// Compiled schedule: knows only the upcoming fire times
pub trait Trigger: Send + Sync + std::fmt::Debug {
    /// First fire time strictly after `after`, or `None` if the trigger is exhausted
    fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>>;

    /// The next `count` fire times after `after`
    fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut fires = Vec::with_capacity(count);
        let mut cursor = after;
        while fires.len() < count {
            match self.next_fire_after(cursor) {
                Some(next) => {
                    fires.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        fires
    }
}

fn parse_cron(expression: &str) -> Result<Schedule> {
    Schedule::from_str(expression).map_err(|e| {
        BridgeError::InvalidSchedule(format!("invalid cron expression '{}': {}", expression, e))
    })
}

/// Next whole minute strictly after `now`
pub fn next_even_minute(now: DateTime<Utc>) -> DateTime<Utc> {
    let truncated = now
        .with_nanosecond(0)
        .and_then(|t| t.with_second(0))
        .unwrap_or(now);
    truncated + Duration::minutes(1)
}

#[derive(Debug)]
struct CronTrigger {
    expression: String,
    schedule: Schedule,
}

impl Trigger for CronTrigger {
    fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

#[derive(Debug)]
struct IntervalTrigger {
    anchor: DateTime<Utc>,
    every: Duration,
}

impl Trigger for IntervalTrigger {
    fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if after < self.anchor {
            return Some(self.anchor);
        }
        let every_ms = self.every.num_milliseconds();
        let elapsed_ms = (after - self.anchor).num_milliseconds();
        let periods = elapsed_ms / every_ms + 1;
        Some(self.anchor + Duration::milliseconds(periods * every_ms))
    }
}

#[derive(Debug)]
struct DailyTrigger {
    days: Vec<Weekday>,
    time: NaiveTime,
}

impl Trigger for DailyTrigger {
    fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let today = after.with_timezone(&Local).date_naive();
        // a week and a day covers "today, but the time already passed"
        for offset in 0..=8 {
            let date = today.checked_add_days(Days::new(offset))?;
            if !self.days.contains(&date.weekday()) {
                continue;
            }
            // skipped when the wall time falls into a DST gap
            let Some(local) = Local.from_local_datetime(&date.and_time(self.time)).earliest() else {
                continue;
            };
            let fire = local.with_timezone(&Utc);
            if fire > after {
                return Some(fire);
            }
        }
        None
    }
}

/// Weekdays in Monday-first order, each once
fn distinct_days(days: &[Weekday]) -> Vec<Weekday> {
    let mut days = days.to_vec();
    days.sort_by_key(Weekday::num_days_from_monday);
    days.dedup();
    days
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_next_even_minute() {
        assert_eq!(next_even_minute(utc(10, 7, 30)), utc(10, 8, 0));
        assert_eq!(next_even_minute(utc(10, 7, 0)), utc(10, 8, 0));
        assert_eq!(next_even_minute(utc(23, 59, 59)), Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_interval_trigger() {
        let now = utc(10, 7, 30);
        let trigger = ScheduleInfo::every_minutes(15).compile(now).unwrap();

        assert_eq!(trigger.next_fire_after(now), Some(utc(10, 8, 0)));
        assert_eq!(trigger.next_fire_after(utc(10, 8, 0)), Some(utc(10, 23, 0)));
        assert_eq!(trigger.next_fire_after(utc(10, 22, 59)), Some(utc(10, 23, 0)));
        assert_eq!(
            trigger.upcoming(now, 4),
            vec![utc(10, 8, 0), utc(10, 23, 0), utc(10, 38, 0), utc(10, 53, 0)]
        );
    }

    #[test]
    fn test_interval_mixed_units() {
        let schedule = ScheduleInfo::Interval {
            days: 0,
            hours: 1,
            minutes: 30,
            seconds: 15,
        };
        let trigger = schedule.compile(utc(0, 0, 10)).unwrap();
        let fires = trigger.upcoming(utc(0, 0, 10), 2);
        assert_eq!(fires, vec![utc(0, 1, 0), utc(1, 31, 15)]);
    }

    #[test]
    fn test_zero_interval_is_invalid() {
        let result = ScheduleInfo::every_minutes(0).compile(utc(0, 0, 0));
        assert!(matches!(result, Err(BridgeError::InvalidSchedule(_))));
    }

    #[test]
    fn test_cron_trigger() {
        let trigger = ScheduleInfo::cron("0 */15 * * * *").compile(utc(0, 0, 0)).unwrap();
        assert_eq!(trigger.next_fire_after(utc(10, 7, 0)), Some(utc(10, 15, 0)));
        assert_eq!(trigger.next_fire_after(utc(10, 15, 0)), Some(utc(10, 30, 0)));
    }

    #[test]
    fn test_invalid_cron() {
        for expression in ["invalid", "60 * * * * *", ""] {
            assert!(matches!(
                ScheduleInfo::cron(expression).validate(),
                Err(BridgeError::InvalidSchedule(_))
            ));
        }
    }

    #[test]
    fn test_daily_trigger_matches_weekday_and_time() {
        let time = NaiveTime::from_hms_opt(6, 30, 0).unwrap();
        let days = vec![Weekday::Mon, Weekday::Thu];
        let trigger = ScheduleInfo::daily(days.clone(), time).compile(utc(0, 0, 0)).unwrap();

        let mut cursor = utc(12, 0, 0);
        for fire in trigger.upcoming(cursor, 6) {
            let local = fire.with_timezone(&Local);
            assert!(fire > cursor);
            assert!(fire - cursor <= Duration::days(7));
            assert!(days.contains(&local.weekday()));
            assert_eq!(local.time(), time);
            cursor = fire;
        }
    }

    #[test]
    fn test_daily_repeated_weekdays_collapse() {
        assert_eq!(
            distinct_days(&[Weekday::Thu, Weekday::Mon, Weekday::Thu, Weekday::Mon]),
            vec![Weekday::Mon, Weekday::Thu]
        );

        let time = NaiveTime::from_hms_opt(6, 30, 0).unwrap();
        let repeated = ScheduleInfo::daily(vec![Weekday::Mon, Weekday::Thu, Weekday::Mon], time)
            .compile(utc(0, 0, 0))
            .unwrap();
        let plain = ScheduleInfo::daily(vec![Weekday::Mon, Weekday::Thu], time)
            .compile(utc(0, 0, 0))
            .unwrap();
        assert_eq!(repeated.upcoming(utc(12, 0, 0), 4), plain.upcoming(utc(12, 0, 0), 4));
    }

    #[test]
    fn test_daily_without_days_is_invalid() {
        let time = NaiveTime::from_hms_opt(6, 30, 0).unwrap();
        assert!(ScheduleInfo::daily(vec![], time).validate().is_err());
    }

    #[test]
    fn test_schedule_serde() {
        let schedule: ScheduleInfo = serde_yaml::from_str("interval: { hours: 2 }").unwrap();
        assert_eq!(
            schedule,
            ScheduleInfo::Interval {
                days: 0,
                hours: 2,
                minutes: 0,
                seconds: 0
            }
        );

        let schedule: ScheduleInfo =
            serde_yaml::from_str("daily: { days: [Mon, Fri], time: \"06:30:00\" }").unwrap();
        assert_eq!(
            schedule,
            ScheduleInfo::daily(
                vec![Weekday::Mon, Weekday::Fri],
                NaiveTime::from_hms_opt(6, 30, 0).unwrap()
            )
        );

        let schedule: ScheduleInfo = serde_yaml::from_str("cron: { expression: \"0 0 2 * * *\" }").unwrap();
        assert_eq!(schedule.to_string(), "cron '0 0 2 * * *'");
    }
}
