//! Date and datetime wire representations.
//!
//! A date travels as a day count (`u32`) from the proleptic civil calendar.
//! A datetime travels as a `u64`: the day count in the high 32 bits and the
//! milliseconds since midnight in the low 32 bits.

use std::fmt;

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

use crate::error::ValueError;

const MS_PER_HOUR: u32 = 3_600_000;
const MS_PER_MINUTE: u32 = 60_000;
const MS_PER_SECOND: u32 = 1_000;

pub fn is_leap_year(year: i32) -> bool {
    year % 400 == 0 || (year % 4 == 0 && year % 100 != 0)
}

fn days_in_month(year: i32, month: i32) -> i32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if is_leap_year(year) => 29,
        2 => 28,
        _ => 0,
    }
}

fn days_before_year(y: i64) -> i64 {
    365 * y + y / 4 - y / 100 + y / 400
}

// ============================================================================
// Date
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Date {
    pub year: i32,
    pub month: i32,
    pub day: i32,
}

impl Date {
    pub fn new(year: i32, month: i32, day: i32) -> Result<Self, ValueError> {
        if !Self::validate(year, month, day) {
            return Err(ValueError::InvalidDate { year, month, day });
        }
        Ok(Self { year, month, day })
    }

    pub fn validate(year: i32, month: i32, day: i32) -> bool {
        (0..=10000).contains(&year)
            && (1..=12).contains(&month)
            && day >= 1
            && day <= days_in_month(year, month)
    }

    pub fn ensure_valid(&self) -> Result<(), ValueError> {
        if !Self::validate(self.year, self.month, self.day) {
            return Err(ValueError::InvalidDate {
                year: self.year,
                month: self.month,
                day: self.day,
            });
        }
        Ok(())
    }

    /// Day count. Dates before 0000-03-01 wrap below zero, as on the wire.
    pub fn encode(&self) -> u32 {
        let m = ((self.month + 9) % 12) as i64;
        let y = self.year as i64 - m / 10;
        let days = days_before_year(y) + (m * 306 + 5) / 10 + (self.day as i64 - 1);
        days as i32 as u32
    }

    pub fn decode(raw: u32) -> Self {
        let d = raw as i32 as i64;
        let mut y = (10000 * d + 14780) / 3_652_425;
        let mut dd = d - days_before_year(y);
        if dd < 0 {
            y -= 1;
            dd = d - days_before_year(y);
        }
        let mi = (100 * dd + 52) / 3060;
        Self {
            year: (y + (mi + 2) / 12) as i32,
            month: ((mi + 2) % 12 + 1) as i32,
            day: (dd - (mi * 306 + 5) / 10 + 1) as i32,
        }
    }
}

impl fmt::Display for Date {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

impl TryFrom<NaiveDate> for Date {
    type Error = ValueError;

    fn try_from(d: NaiveDate) -> Result<Self, ValueError> {
        Date::new(d.year(), d.month() as i32, d.day() as i32)
    }
}

impl TryFrom<Date> for NaiveDate {
    type Error = ValueError;

    fn try_from(d: Date) -> Result<Self, ValueError> {
        NaiveDate::from_ymd_opt(d.year, d.month as u32, d.day as u32).ok_or(
            ValueError::InvalidDate {
                year: d.year,
                month: d.month,
                day: d.day,
            },
        )
    }
}

// ============================================================================
// DateTime
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DateTime {
    pub date: Date,
    pub hour: i32,
    pub minute: i32,
    pub second: i32,
    pub millisecond: i32,
}

impl DateTime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        year: i32,
        month: i32,
        day: i32,
        hour: i32,
        minute: i32,
        second: i32,
        millisecond: i32,
    ) -> Result<Self, ValueError> {
        let date = Date::new(year, month, day)?;
        if !Self::validate_time(hour, minute, second, millisecond) {
            return Err(ValueError::InvalidTime {
                hour,
                minute,
                second,
                millisecond,
            });
        }
        Ok(Self {
            date,
            hour,
            minute,
            second,
            millisecond,
        })
    }

    pub fn validate_time(hour: i32, minute: i32, second: i32, millisecond: i32) -> bool {
        (0..24).contains(&hour)
            && (0..60).contains(&minute)
            && (0..60).contains(&second)
            && (0..1000).contains(&millisecond)
    }

    pub fn validate(&self) -> bool {
        Date::validate(self.date.year, self.date.month, self.date.day)
            && Self::validate_time(self.hour, self.minute, self.second, self.millisecond)
    }

    pub fn ensure_valid(&self) -> Result<(), ValueError> {
        self.date.ensure_valid()?;
        if !Self::validate_time(self.hour, self.minute, self.second, self.millisecond) {
            return Err(ValueError::InvalidTime {
                hour: self.hour,
                minute: self.minute,
                second: self.second,
                millisecond: self.millisecond,
            });
        }
        Ok(())
    }

    /// Only meaningful for valid values; out-of-range fields wrap.
    pub fn encode(&self) -> u64 {
        let time = self.hour as i64 * MS_PER_HOUR as i64
            + self.minute as i64 * MS_PER_MINUTE as i64
            + self.second as i64 * MS_PER_SECOND as i64
            + self.millisecond as i64;
        ((self.date.encode() as u64) << 32) | (time as u32 as u64)
    }

    /// Milliseconds past a full day decode to an hour of 24 or more; see [`Self::validate`].
    pub fn decode(raw: u64) -> Self {
        let date = Date::decode((raw >> 32) as u32);
        let time = raw as u32;
        Self {
            date,
            hour: (time / MS_PER_HOUR) as i32,
            minute: (time % MS_PER_HOUR / MS_PER_MINUTE) as i32,
            second: (time % MS_PER_MINUTE / MS_PER_SECOND) as i32,
            millisecond: (time % MS_PER_SECOND) as i32,
        }
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:02}:{:02}:{:02}.{:03}",
            self.date, self.hour, self.minute, self.second, self.millisecond
        )
    }
}

impl TryFrom<NaiveDateTime> for DateTime {
    type Error = ValueError;

    fn try_from(dt: NaiveDateTime) -> Result<Self, ValueError> {
        DateTime::new(
            dt.year(),
            dt.month() as i32,
            dt.day() as i32,
            dt.hour() as i32,
            dt.minute() as i32,
            dt.second() as i32,
            (dt.nanosecond() / 1_000_000).min(999) as i32,
        )
    }
}

impl TryFrom<DateTime> for NaiveDateTime {
    type Error = ValueError;

    fn try_from(dt: DateTime) -> Result<Self, ValueError> {
        let date = NaiveDate::try_from(dt.date)?;
        date.and_hms_milli_opt(
            dt.hour as u32,
            dt.minute as u32,
            dt.second as u32,
            dt.millisecond as u32,
        )
        .ok_or(ValueError::InvalidTime {
            hour: dt.hour,
            minute: dt.minute,
            second: dt.second,
            millisecond: dt.millisecond,
        })
    }
}
