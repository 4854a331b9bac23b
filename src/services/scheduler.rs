//! Wall-clock rollup trigger, independent of the sampling loop.
//!
//! Wakes shortly after every full hour and asks [`Rollups`] for the hourly rollup, plus the daily
//! one at local midnight. Rollups already done by the loop are skipped by `Rollups` itself.

use crate::db::sink::TimeSeriesSink;
use crate::services::rollup::{Rollups, Tier};
use crate::utils::{Clock, start_of_day, start_of_hour};
use chrono::{DateTime, FixedOffset};
use log::{debug, info, warn};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Delay after the boundary so the last samples of the window are stored.
pub const GRACE: Duration = Duration::from_secs(15);

pub fn spawn<S, C>(rollups: Arc<Rollups>, mut sink: S, clock: C) -> io::Result<JoinHandle<()>>
where
    S: TimeSeriesSink + Send + 'static,
    C: Clock + Send + 'static,
{
    thread::Builder::new()
        .name("rollup-scheduler".into())
        .spawn(move || {
            info!("Rollup scheduler started");
            loop {
                tick(&rollups, &mut sink, &clock);
            }
        })
}

pub fn delay_until_next_hour(now: &DateTime<FixedOffset>, grace: Duration) -> Duration {
    let next = start_of_hour(now) + chrono::Duration::hours(1);
    (next - *now).to_std().unwrap_or_default() + grace
}

fn tick(rollups: &Rollups, sink: &mut dyn TimeSeriesSink, clock: &dyn Clock) {
    clock.sleep(delay_until_next_hour(&clock.now(), GRACE));
    let now = clock.now();

    let mut tiers = vec![Tier::Hourly];
    if start_of_hour(&now) == start_of_day(&now) {
        tiers.push(Tier::Daily);
    }
    for tier in tiers {
        match rollups.run(tier, &now, sink) {
            Ok(outcome) => debug!("Scheduled {} rollup: {:?}", tier.label(), outcome),
            Err(e) => warn!("Scheduled {} rollup failed: {}", tier.label(), e),
        }
    }
}
