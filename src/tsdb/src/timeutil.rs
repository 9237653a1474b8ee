// Copyright 2023 Greptime Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Time partitioning primitives.
//!
//! An [`Interval`] is a configured write or rollup granularity. Each interval
//! classifies into an [`IntervalType`] which decides how data is bucketed on
//! disk: one segment per day/month/year, one data family per hour/day/month
//! within a segment. All derivations are pure functions of
//! (interval, timestamp), so looking the same bucket up twice always yields
//! the same identity.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::OptionExt;

use crate::error::{
    Error, InvalidIntervalSnafu, InvalidSegmentNameSnafu, InvalidTimestampSnafu, Result,
};

/// Millisecond timestamp.
pub type Timestamp = i64;

pub const ONE_SECOND: i64 = 1000;
pub const ONE_MINUTE: i64 = 60 * ONE_SECOND;
pub const ONE_HOUR: i64 = 60 * ONE_MINUTE;
pub const ONE_DAY: i64 = 24 * ONE_HOUR;

/// A time range with inclusive start and exclusive end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeRange {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeRange {
    pub fn new(start: Timestamp, end: Timestamp) -> TimeRange {
        TimeRange { start, end }
    }

    /// Returns true if `timestamp` is contained in the range.
    pub fn contains(&self, timestamp: Timestamp) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    /// Returns true if the two ranges share any timestamp.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

impl Display for TimeRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Segment granularity an interval maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntervalType {
    Day,
    Month,
    Year,
}

impl Display for IntervalType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            IntervalType::Day => write!(f, "day"),
            IntervalType::Month => write!(f, "month"),
            IntervalType::Year => write!(f, "year"),
        }
    }
}

/// A configured time granularity in milliseconds.
///
/// Parses from and formats to the short form used in options files
/// (`"10s"`, `"5m"`, `"1h"`, `"1d"`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct Interval(i64);

impl Interval {
    pub const fn from_millis(millis: i64) -> Interval {
        Interval(millis)
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    /// Classifies the interval by magnitude: fine-grained intervals bucket
    /// their segments by day, coarser rollups by month or year.
    pub fn interval_type(&self) -> IntervalType {
        if self.0 >= 30 * ONE_MINUTE {
            IntervalType::Year
        } else if self.0 >= 5 * ONE_MINUTE {
            IntervalType::Month
        } else {
            IntervalType::Day
        }
    }

    pub fn calculator(&self) -> &'static dyn IntervalCalculator {
        match self.interval_type() {
            IntervalType::Day => &DayCalculator,
            IntervalType::Month => &MonthCalculator,
            IntervalType::Year => &YearCalculator,
        }
    }
}

impl Display for Interval {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let ms = self.0;
        if ms % ONE_DAY == 0 {
            write!(f, "{}d", ms / ONE_DAY)
        } else if ms % ONE_HOUR == 0 {
            write!(f, "{}h", ms / ONE_HOUR)
        } else if ms % ONE_MINUTE == 0 {
            write!(f, "{}m", ms / ONE_MINUTE)
        } else if ms % ONE_SECOND == 0 {
            write!(f, "{}s", ms / ONE_SECOND)
        } else {
            write!(f, "{}ms", ms)
        }
    }
}

impl FromStr for Interval {
    type Err = Error;

    fn from_str(s: &str) -> Result<Interval> {
        let s = s.trim();
        let digits = s.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return InvalidIntervalSnafu { input: s }.fail();
        }
        let value: i64 = s[..digits]
            .parse()
            .ok()
            .context(InvalidIntervalSnafu { input: s })?;
        let unit = match &s[digits..] {
            "ms" => 1,
            "s" => ONE_SECOND,
            "m" => ONE_MINUTE,
            "h" => ONE_HOUR,
            "d" => ONE_DAY,
            _ => return InvalidIntervalSnafu { input: s }.fail(),
        };
        if value <= 0 {
            return InvalidIntervalSnafu { input: s }.fail();
        }
        Ok(Interval(value * unit))
    }
}

impl TryFrom<String> for Interval {
    type Error = Error;

    fn try_from(value: String) -> Result<Interval> {
        value.parse()
    }
}

impl From<Interval> for String {
    fn from(interval: Interval) -> String {
        interval.to_string()
    }
}

/// Pure bucketing functions of one [`IntervalType`].
///
/// Segment names and family indices derive deterministically from timestamps;
/// the segment hierarchy relies on this for idempotent lookup-or-create.
pub trait IntervalCalculator: Send + Sync {
    /// Name of the segment the timestamp falls into.
    fn segment_name(&self, timestamp: Timestamp) -> Result<String>;

    /// Inverse of [`Self::segment_name`], used to reload segment directories
    /// persisted by an earlier run.
    fn parse_segment_name(&self, name: &str) -> Result<Timestamp>;

    /// Aligned base time of the segment the timestamp falls into.
    fn segment_time(&self, timestamp: Timestamp) -> Result<Timestamp>;

    /// Time range covered by the segment starting at `segment_time`.
    fn segment_time_range(&self, segment_time: Timestamp) -> Result<TimeRange>;

    /// Index of the data family within its segment.
    fn family(&self, timestamp: Timestamp, segment_time: Timestamp) -> Result<i32>;

    /// Time range covered by one data family of the segment.
    fn family_time_range(&self, segment_time: Timestamp, family: i32) -> Result<TimeRange>;
}

fn utc(timestamp: Timestamp) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(timestamp).context(InvalidTimestampSnafu { timestamp })
}

fn date_start_millis(date: NaiveDate) -> Timestamp {
    date.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
}

/// Day segments, one family per hour.
pub struct DayCalculator;

impl IntervalCalculator for DayCalculator {
    fn segment_name(&self, timestamp: Timestamp) -> Result<String> {
        Ok(utc(timestamp)?.format("%Y%m%d").to_string())
    }

    fn parse_segment_name(&self, name: &str) -> Result<Timestamp> {
        let date = NaiveDate::parse_from_str(name, "%Y%m%d")
            .ok()
            .context(InvalidSegmentNameSnafu { name })?;
        Ok(date_start_millis(date))
    }

    fn segment_time(&self, timestamp: Timestamp) -> Result<Timestamp> {
        Ok(date_start_millis(utc(timestamp)?.date_naive()))
    }

    fn segment_time_range(&self, segment_time: Timestamp) -> Result<TimeRange> {
        Ok(TimeRange::new(segment_time, segment_time + ONE_DAY))
    }

    fn family(&self, timestamp: Timestamp, segment_time: Timestamp) -> Result<i32> {
        Ok(((timestamp - segment_time) / ONE_HOUR) as i32)
    }

    fn family_time_range(&self, segment_time: Timestamp, family: i32) -> Result<TimeRange> {
        let start = segment_time + i64::from(family) * ONE_HOUR;
        Ok(TimeRange::new(start, start + ONE_HOUR))
    }
}

/// Month segments, one family per day of month (1-based).
pub struct MonthCalculator;

impl IntervalCalculator for MonthCalculator {
    fn segment_name(&self, timestamp: Timestamp) -> Result<String> {
        Ok(utc(timestamp)?.format("%Y%m").to_string())
    }

    fn parse_segment_name(&self, name: &str) -> Result<Timestamp> {
        let date = NaiveDate::parse_from_str(&format!("{name}01"), "%Y%m%d")
            .ok()
            .context(InvalidSegmentNameSnafu { name })?;
        Ok(date_start_millis(date))
    }

    fn segment_time(&self, timestamp: Timestamp) -> Result<Timestamp> {
        let date = utc(timestamp)?
            .date_naive()
            .with_day(1)
            .context(InvalidTimestampSnafu { timestamp })?;
        Ok(date_start_millis(date))
    }

    fn segment_time_range(&self, segment_time: Timestamp) -> Result<TimeRange> {
        let start = utc(segment_time)?.date_naive();
        let end = start
            .checked_add_months(Months::new(1))
            .context(InvalidTimestampSnafu {
                timestamp: segment_time,
            })?;
        Ok(TimeRange::new(segment_time, date_start_millis(end)))
    }

    fn family(&self, timestamp: Timestamp, _segment_time: Timestamp) -> Result<i32> {
        Ok(utc(timestamp)?.day() as i32)
    }

    fn family_time_range(&self, segment_time: Timestamp, family: i32) -> Result<TimeRange> {
        let start = segment_time + i64::from(family - 1) * ONE_DAY;
        Ok(TimeRange::new(start, start + ONE_DAY))
    }
}

/// Year segments, one family per month (1-based).
pub struct YearCalculator;

impl IntervalCalculator for YearCalculator {
    fn segment_name(&self, timestamp: Timestamp) -> Result<String> {
        Ok(utc(timestamp)?.format("%Y").to_string())
    }

    fn parse_segment_name(&self, name: &str) -> Result<Timestamp> {
        let date = NaiveDate::parse_from_str(&format!("{name}0101"), "%Y%m%d")
            .ok()
            .context(InvalidSegmentNameSnafu { name })?;
        Ok(date_start_millis(date))
    }

    fn segment_time(&self, timestamp: Timestamp) -> Result<Timestamp> {
        let dt = utc(timestamp)?;
        let date = NaiveDate::from_ymd_opt(dt.year(), 1, 1)
            .context(InvalidTimestampSnafu { timestamp })?;
        Ok(date_start_millis(date))
    }

    fn segment_time_range(&self, segment_time: Timestamp) -> Result<TimeRange> {
        let year = utc(segment_time)?.year();
        let end = NaiveDate::from_ymd_opt(year + 1, 1, 1).context(InvalidTimestampSnafu {
            timestamp: segment_time,
        })?;
        Ok(TimeRange::new(segment_time, date_start_millis(end)))
    }

    fn family(&self, timestamp: Timestamp, _segment_time: Timestamp) -> Result<i32> {
        Ok(utc(timestamp)?.month() as i32)
    }

    fn family_time_range(&self, segment_time: Timestamp, family: i32) -> Result<TimeRange> {
        let year = utc(segment_time)?.year();
        let start = NaiveDate::from_ymd_opt(year, family as u32, 1).context(
            InvalidTimestampSnafu {
                timestamp: segment_time,
            },
        )?;
        let end = start
            .checked_add_months(Months::new(1))
            .context(InvalidTimestampSnafu {
                timestamp: segment_time,
            })?;
        Ok(TimeRange::new(
            date_start_millis(start),
            date_start_millis(end),
        ))
    }
}
