//! Detects hour and calendar-date rollover between successive checks.

use chrono::{DateTime, NaiveDate, TimeZone, Timelike};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundaryDetector {
    /// Unix time at which the current local hour began.
    hour: i64,
    date: NaiveDate,
}

/// Repeated wall-clock hours (a DST fall-back) start at different instants, so they stay apart.
fn hour_start<Tz: TimeZone>(now: &DateTime<Tz>) -> i64 {
    now.timestamp() - i64::from(now.minute() * 60 + now.second())
}

impl BoundaryDetector {
    /// Starts tracking at `now`; the current hour and date count as already seen.
    pub fn new<Tz: TimeZone>(now: &DateTime<Tz>) -> Self {
        BoundaryDetector {
            hour: hour_start(now),
            date: now.date_naive(),
        }
    }

    /// True once per change of the local hour, then remembers the new hour.
    pub fn hour_rolled_over<Tz: TimeZone>(&mut self, now: &DateTime<Tz>) -> bool {
        let hour = hour_start(now);
        if hour == self.hour {
            return false;
        }
        self.hour = hour;
        true
    }

    /// True once per change of the local date, then remembers the new date.
    pub fn date_rolled_over<Tz: TimeZone>(&mut self, now: &DateTime<Tz>) -> bool {
        let date = now.date_naive();
        if date == self.date {
            return false;
        }
        self.date = date;
        true
    }
}
