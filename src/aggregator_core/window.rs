//! UTC day windows and the trailing multi-day windows built from them

use crate::types::{floor_day, SECONDS_PER_DAY, SECONDS_PER_HOUR};
use chrono::{DateTime, Utc};
use std::fmt;

/// One UTC calendar day, `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DayWindow {
    pub start: i64,
    pub end: i64,
}

impl DayWindow {
    /// The day containing `ts`
    pub fn containing(ts: i64) -> Self {
        Self::starting_at(floor_day(ts))
    }

    /// `day_start` must be a UTC midnight
    pub fn starting_at(day_start: i64) -> Self {
        Self {
            start: day_start,
            end: day_start + SECONDS_PER_DAY,
        }
    }

    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Length of `[from, to) ∩ [start, end)` in seconds
    pub fn overlap(&self, from: i64, to: i64) -> i64 {
        (to.min(self.end) - from.max(self.start)).max(0)
    }

    pub fn next(&self) -> Self {
        Self::starting_at(self.end)
    }
}

impl fmt::Display for DayWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match DateTime::<Utc>::from_timestamp(self.start, 0) {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%d")),
            None => write!(f, "day@{}", self.start),
        }
    }
}

/// A trailing window of `length_days` whole days ending with `last_day`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RollupWindow {
    pub start: i64,
    pub length_days: u32,
}

impl RollupWindow {
    pub fn ending_on(last_day: DayWindow, length_days: u32) -> Self {
        Self {
            start: last_day.start - (length_days as i64 - 1) * SECONDS_PER_DAY,
            length_days,
        }
    }

    /// Exclusive end
    pub fn end(&self) -> i64 {
        self.start + self.length_days as i64 * SECONDS_PER_DAY
    }

    pub fn hours(&self) -> f64 {
        window_hours(self.length_days)
    }
}

pub fn window_hours(length_days: u32) -> f64 {
    (length_days as i64 * SECONDS_PER_DAY / SECONDS_PER_HOUR) as f64
}

/// Every window of `length_days` that contains `day` and ends no later than
/// `today`: the windows ending on `day`, `day + 1`, ... up to
/// `min(day + length_days - 1, today)`.
pub fn windows_containing(day: DayWindow, length_days: u32, today: DayWindow) -> Vec<RollupWindow> {
    if length_days == 0 {
        return Vec::new();
    }
    let last_end_day = (day.start + (length_days as i64 - 1) * SECONDS_PER_DAY).min(today.start);

    let mut windows = Vec::new();
    let mut end_day = day;
    while end_day.start <= last_end_day {
        windows.push(RollupWindow::ending_on(end_day, length_days));
        end_day = end_day.next();
    }
    windows
}
