//! Sampling cadence: aligns polls to wall-clock multiples of the interval and sub-samples
//! slow sensor classes.

use chrono::{DateTime, TimeZone};
use std::num::NonZeroU32;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Cadence {
    interval: Duration,
    ratio: NonZeroU32,
    counter: u32,
}

impl Cadence {
    pub fn new(interval: Duration, ratio: NonZeroU32) -> Self {
        // Seeded so that the first call to `should_sample_now` fires.
        Cadence {
            interval,
            ratio,
            counter: ratio.get() - 1,
        }
    }

    /// Time left until the next multiple of the interval since the Unix epoch.
    ///
    /// Always in `[0, interval)`, so the pause does not accumulate the time spent in the
    /// previous cycle.
    pub fn next_sample_delay<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Duration {
        let interval_ns = self.interval.as_nanos() as i128;
        if interval_ns == 0 {
            return Duration::ZERO;
        }
        let now_ns = i128::from(now.timestamp()) * 1_000_000_000 + i128::from(now.timestamp_subsec_nanos());
        let into_interval = now_ns.rem_euclid(interval_ns);
        if into_interval == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos((interval_ns - into_interval) as u64)
        }
    }

    /// True exactly once every `ratio` calls, starting with the first.
    pub fn should_sample_now(&mut self) -> bool {
        if self.counter + 1 >= self.ratio.get() {
            self.counter = 0;
            true
        } else {
            self.counter += 1;
            false
        }
    }

    /// Makes the next `should_sample_now` fire again, after the due sample could not be taken.
    pub fn rearm(&mut self) {
        self.counter = self.ratio.get() - 1;
    }
}
