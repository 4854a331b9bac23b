use chrono::{DateTime, FixedOffset, Local, NaiveTime, TimeZone, Timelike};
use std::time::Duration;

/// Wall-clock time and sleeping, injectable for tests.
pub trait Clock {
    /// Current time in the zone used for hour and date boundaries.
    fn now(&self) -> DateTime<FixedOffset>;

    fn sleep(&self, duration: Duration);
}

/// The host clock in the host's local time zone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Local::now().fixed_offset()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Start of the hour containing `t`, in `t`'s offset.
pub fn start_of_hour(t: &DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    let naive = t.date_naive().and_time(NaiveTime::MIN) + chrono::Duration::hours(i64::from(t.hour()));
    at_offset(t, naive)
}

/// Local midnight starting the day of `t`, in `t`'s offset.
pub fn start_of_day(t: &DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    at_offset(t, t.date_naive().and_time(NaiveTime::MIN))
}

fn at_offset(t: &DateTime<FixedOffset>, naive: chrono::NaiveDateTime) -> DateTime<FixedOffset> {
    // A fixed offset maps every local time to exactly one instant.
    t.offset()
        .from_local_datetime(&naive)
        .single()
        .unwrap_or(*t)
}
