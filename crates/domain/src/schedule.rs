//! 单条调度规则
//!
//! `Schedule` 是纯函数式的：给定参考时间，计算下一次运行时间。
//! 周期类规则先在参考时间所在周期内求出边界时刻，若该时刻不晚于参考时间，
//! 再顺延一个完整间隔，因此结果总是严格晚于参考时间。所有计算均基于 UTC。

use std::fmt;

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::{SchedulerError, SchedulerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalendarUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl CalendarUnit {
    /// 在 `reference` 上加 `amount` 个单位，溢出时返回 None
    pub fn add(self, reference: DateTime<Utc>, amount: u32) -> Option<DateTime<Utc>> {
        let amount_i = i64::from(amount);
        match self {
            CalendarUnit::Second => reference.checked_add_signed(Duration::seconds(amount_i)),
            CalendarUnit::Minute => reference.checked_add_signed(Duration::minutes(amount_i)),
            CalendarUnit::Hour => reference.checked_add_signed(Duration::hours(amount_i)),
            CalendarUnit::Day => reference.checked_add_signed(Duration::days(amount_i)),
            CalendarUnit::Week => reference.checked_add_signed(Duration::weeks(amount_i)),
            CalendarUnit::Month => reference.checked_add_months(Months::new(amount)),
            CalendarUnit::Year => {
                reference.checked_add_months(Months::new(amount.checked_mul(12)?))
            }
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            CalendarUnit::Second => "second",
            CalendarUnit::Minute => "minute",
            CalendarUnit::Hour => "hour",
            CalendarUnit::Day => "day",
            CalendarUnit::Week => "week",
            CalendarUnit::Month => "month",
            CalendarUnit::Year => "year",
        }
    }
}

/// 调度规则
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// 每 `every` 分钟，在第 `second` 秒
    Minutely { every: u32, second: u32 },
    /// 每 `every` 小时，在第 `minute` 分
    Hourly { every: u32, minute: u32 },
    Daily { every: u32, hour: u32, minute: u32 },
    Weekly {
        every: u32,
        weekday: Weekday,
        hour: u32,
        minute: u32,
    },
    /// `day` 超过当月天数时取当月最后一天
    Monthly {
        every: u32,
        day: u32,
        hour: u32,
        minute: u32,
    },
    Yearly {
        every: u32,
        month: u32,
        day: u32,
        hour: u32,
        minute: u32,
    },
    /// 固定时刻，与参考时间无关
    Absolute { at: DateTime<Utc> },
    /// 参考时间加上固定偏移；`amount == 0` 表示立即运行
    Relative { unit: CalendarUnit, amount: u32 },
}

impl Schedule {
    pub fn immediate() -> Self {
        Schedule::Relative {
            unit: CalendarUnit::Second,
            amount: 0,
        }
    }

    pub fn after(unit: CalendarUnit, amount: u32) -> Self {
        Schedule::Relative { unit, amount }
    }

    pub fn at(at: DateTime<Utc>) -> Self {
        Schedule::Absolute { at }
    }

    pub fn every_minutes(every: u32) -> Self {
        Schedule::Minutely { every, second: 0 }
    }

    pub fn hourly(minute: u32) -> Self {
        Schedule::Hourly { every: 1, minute }
    }

    pub fn daily(hour: u32, minute: u32) -> Self {
        Schedule::Daily {
            every: 1,
            hour,
            minute,
        }
    }

    pub fn weekly(weekday: Weekday, hour: u32, minute: u32) -> Self {
        Schedule::Weekly {
            every: 1,
            weekday,
            hour,
            minute,
        }
    }

    pub fn monthly(day: u32, hour: u32, minute: u32) -> Self {
        Schedule::Monthly {
            every: 1,
            day,
            hour,
            minute,
        }
    }

    /// 日历周期类规则
    pub fn is_periodic(&self) -> bool {
        !matches!(self, Schedule::Absolute { .. } | Schedule::Relative { .. })
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        match *self {
            Schedule::Minutely { every, second } => {
                check_every(every)?;
                check_range("second", second, 0, 59)
            }
            Schedule::Hourly { every, minute } => {
                check_every(every)?;
                check_range("minute", minute, 0, 59)
            }
            Schedule::Daily {
                every,
                hour,
                minute,
            }
            | Schedule::Weekly {
                every,
                hour,
                minute,
                ..
            } => {
                check_every(every)?;
                check_time(hour, minute)
            }
            Schedule::Monthly {
                every,
                day,
                hour,
                minute,
            } => {
                check_every(every)?;
                check_range("day", day, 1, 31)?;
                check_time(hour, minute)
            }
            Schedule::Yearly {
                every,
                month,
                day,
                hour,
                minute,
            } => {
                check_every(every)?;
                check_range("month", month, 1, 12)?;
                check_range("day", day, 1, 31)?;
                check_time(hour, minute)
            }
            Schedule::Absolute { .. } | Schedule::Relative { .. } => Ok(()),
        }
    }

    /// 计算参考时间之后的下一次运行时间
    ///
    /// 规则非法或时间溢出时返回 None。
    pub fn next_run_time(&self, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.validate().is_err() {
            return None;
        }

        match *self {
            Schedule::Minutely { every, second } => {
                let date = reference.date_naive();
                let boundary = at_time(date, reference.hour(), reference.minute(), second)?;
                roll(boundary, reference, |t| {
                    t.checked_add_signed(Duration::minutes(i64::from(every)))
                })
            }
            Schedule::Hourly { every, minute } => {
                let boundary = at_time(reference.date_naive(), reference.hour(), minute, 0)?;
                roll(boundary, reference, |t| {
                    t.checked_add_signed(Duration::hours(i64::from(every)))
                })
            }
            Schedule::Daily {
                every,
                hour,
                minute,
            } => {
                let boundary = at_time(reference.date_naive(), hour, minute, 0)?;
                roll(boundary, reference, |t| {
                    t.checked_add_signed(Duration::days(i64::from(every)))
                })
            }
            Schedule::Weekly {
                every,
                weekday,
                hour,
                minute,
            } => {
                let date = reference.date_naive();
                let monday = date.checked_sub_signed(Duration::days(i64::from(
                    date.weekday().num_days_from_monday(),
                )))?;
                let target = monday.checked_add_signed(Duration::days(i64::from(
                    weekday.num_days_from_monday(),
                )))?;
                let boundary = at_time(target, hour, minute, 0)?;
                roll(boundary, reference, |t| {
                    t.checked_add_signed(Duration::weeks(i64::from(every)))
                })
            }
            Schedule::Monthly {
                every,
                day,
                hour,
                minute,
            } => {
                let month_index =
                    i64::from(reference.year()) * 12 + i64::from(reference.month0());
                let boundary = month_boundary(month_index, day, hour, minute)?;
                if boundary > reference {
                    Some(boundary)
                } else {
                    month_boundary(month_index + i64::from(every), day, hour, minute)
                }
            }
            Schedule::Yearly {
                every,
                month,
                day,
                hour,
                minute,
            } => {
                let month_index = i64::from(reference.year()) * 12 + i64::from(month - 1);
                let boundary = month_boundary(month_index, day, hour, minute)?;
                if boundary > reference {
                    Some(boundary)
                } else {
                    month_boundary(month_index + 12 * i64::from(every), day, hour, minute)
                }
            }
            Schedule::Absolute { at } => Some(at),
            Schedule::Relative { unit, amount } => unit.add(reference, amount),
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Minutely { every, second } => {
                write!(f, "minutely(every={every},second={second})")
            }
            Schedule::Hourly { every, minute } => write!(f, "hourly(every={every},minute={minute})"),
            Schedule::Daily {
                every,
                hour,
                minute,
            } => write!(f, "daily(every={every},{hour:02}:{minute:02})"),
            Schedule::Weekly {
                every,
                weekday,
                hour,
                minute,
            } => write!(f, "weekly(every={every},{weekday},{hour:02}:{minute:02})"),
            Schedule::Monthly {
                every,
                day,
                hour,
                minute,
            } => write!(f, "monthly(every={every},day={day},{hour:02}:{minute:02})"),
            Schedule::Yearly {
                every,
                month,
                day,
                hour,
                minute,
            } => write!(
                f,
                "yearly(every={every},{month:02}-{day:02},{hour:02}:{minute:02})"
            ),
            Schedule::Absolute { at } => write!(f, "absolute({})", at.to_rfc3339()),
            Schedule::Relative { unit, amount } => {
                write!(f, "relative({amount} {})", unit.as_str())
            }
        }
    }
}

fn roll<F>(boundary: DateTime<Utc>, reference: DateTime<Utc>, advance: F) -> Option<DateTime<Utc>>
where
    F: FnOnce(DateTime<Utc>) -> Option<DateTime<Utc>>,
{
    if boundary > reference {
        Some(boundary)
    } else {
        advance(boundary)
    }
}

fn at_time(date: NaiveDate, hour: u32, minute: u32, second: u32) -> Option<DateTime<Utc>> {
    date.and_hms_opt(hour, minute, second)
        .map(|naive| naive.and_utc())
}

/// `month_index` = 年 * 12 + 月(0 起)
fn month_boundary(month_index: i64, day: u32, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
    let year = i32::try_from(month_index.div_euclid(12)).ok()?;
    let month = u32::try_from(month_index.rem_euclid(12)).ok()? + 1;
    let last_day = days_in_month(year, month)?;
    let date = NaiveDate::from_ymd_opt(year, month, day.min(last_day))?;
    at_time(date, hour, minute, 0)
}

fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year.checked_add(1)?, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    first_of_next.pred_opt().map(|d| d.day())
}

fn check_every(every: u32) -> SchedulerResult<()> {
    if every == 0 {
        return Err(SchedulerError::InvalidSchedule(
            "间隔必须大于0".to_string(),
        ));
    }
    Ok(())
}

fn check_time(hour: u32, minute: u32) -> SchedulerResult<()> {
    check_range("hour", hour, 0, 23)?;
    check_range("minute", minute, 0, 59)
}

fn check_range(field: &str, value: u32, min: u32, max: u32) -> SchedulerResult<()> {
    if value < min || value > max {
        return Err(SchedulerError::InvalidSchedule(format!(
            "{field} 超出范围 [{min}, {max}]: {value}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_minutely_same_minute_and_rollover() {
        let schedule = Schedule::Minutely {
            every: 5,
            second: 30,
        };
        assert_eq!(
            schedule.next_run_time(utc(2024, 3, 1, 10, 3, 10)),
            Some(utc(2024, 3, 1, 10, 3, 30))
        );
        assert_eq!(
            schedule.next_run_time(utc(2024, 3, 1, 10, 3, 30)),
            Some(utc(2024, 3, 1, 10, 8, 30))
        );
    }

    #[test]
    fn test_hourly_crosses_midnight() {
        let schedule = Schedule::hourly(15);
        assert_eq!(
            schedule.next_run_time(utc(2024, 3, 1, 23, 20, 0)),
            Some(utc(2024, 3, 2, 0, 15, 0))
        );
    }

    #[test]
    fn test_daily_before_and_after_boundary() {
        let schedule = Schedule::daily(9, 30);
        assert_eq!(
            schedule.next_run_time(utc(2024, 3, 1, 8, 0, 0)),
            Some(utc(2024, 3, 1, 9, 30, 0))
        );
        assert_eq!(
            schedule.next_run_time(utc(2024, 3, 1, 9, 30, 0)),
            Some(utc(2024, 3, 2, 9, 30, 0))
        );
    }

    #[test]
    fn test_weekly_in_same_week_and_next() {
        let schedule = Schedule::weekly(Weekday::Fri, 18, 0);
        // 2024-03-06 是周三
        assert_eq!(
            schedule.next_run_time(utc(2024, 3, 6, 12, 0, 0)),
            Some(utc(2024, 3, 8, 18, 0, 0))
        );
        // 周六 → 下周五
        assert_eq!(
            schedule.next_run_time(utc(2024, 3, 9, 12, 0, 0)),
            Some(utc(2024, 3, 15, 18, 0, 0))
        );
    }

    #[test]
    fn test_monthly_clamps_to_month_end() {
        let schedule = Schedule::monthly(31, 0, 0);
        assert_eq!(
            schedule.next_run_time(utc(2024, 2, 10, 0, 0, 0)),
            Some(utc(2024, 2, 29, 0, 0, 0))
        );
        assert_eq!(
            schedule.next_run_time(utc(2024, 2, 29, 0, 0, 0)),
            Some(utc(2024, 3, 31, 0, 0, 0))
        );
        assert_eq!(
            schedule.next_run_time(utc(2024, 12, 31, 0, 0, 0)),
            Some(utc(2025, 1, 31, 0, 0, 0))
        );
    }

    #[test]
    fn test_yearly_leap_day() {
        let schedule = Schedule::Yearly {
            every: 1,
            month: 2,
            day: 29,
            hour: 12,
            minute: 0,
        };
        assert_eq!(
            schedule.next_run_time(utc(2024, 3, 1, 0, 0, 0)),
            Some(utc(2025, 2, 28, 12, 0, 0))
        );
    }

    #[test]
    fn test_absolute_and_relative() {
        let at = utc(2030, 1, 1, 0, 0, 0);
        assert_eq!(Schedule::at(at).next_run_time(utc(2031, 1, 1, 0, 0, 0)), Some(at));

        let reference = utc(2024, 1, 31, 10, 0, 0);
        assert_eq!(Schedule::immediate().next_run_time(reference), Some(reference));
        assert_eq!(
            Schedule::after(CalendarUnit::Month, 1).next_run_time(reference),
            Some(utc(2024, 2, 29, 10, 0, 0))
        );
        assert_eq!(
            Schedule::after(CalendarUnit::Minute, 90).next_run_time(reference),
            Some(utc(2024, 1, 31, 11, 30, 0))
        );
    }

    #[test]
    fn test_invalid_schedule_yields_none() {
        let schedule = Schedule::daily(24, 0);
        assert!(schedule.validate().is_err());
        assert_eq!(schedule.next_run_time(utc(2024, 1, 1, 0, 0, 0)), None);

        let zero = Schedule::Minutely {
            every: 0,
            second: 0,
        };
        assert!(matches!(
            zero.validate(),
            Err(SchedulerError::InvalidSchedule(_))
        ));
    }

    #[test]
    fn test_display_and_serde() {
        let schedule = Schedule::weekly(Weekday::Mon, 9, 5);
        assert_eq!(schedule.to_string(), "weekly(every=1,Mon,09:05)");

        let json = serde_json::to_string(&schedule).unwrap();
        assert!(json.contains("\"kind\":\"weekly\""));
        let back: Schedule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, schedule);
    }
}
