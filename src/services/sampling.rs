//! The sampling loop: pace, poll, persist the high-rate tier, then check for hour and day
//! boundaries and roll up the window that just closed.

use crate::client::DeviceClient;
use crate::config::{Config, InverterTags};
use crate::db::point::Point;
use crate::db::sink::{PersistError, TimeSeriesSink};
use crate::services::boundary::BoundaryDetector;
use crate::services::cadence::Cadence;
use crate::services::highrate::HighRatePoints;
use crate::services::poller::{FaultCounters, PollOutcome, Poller, RECOVERY_PAUSE, SamplingError};
use crate::services::rollup::{Rollups, Tier};
use crate::utils::Clock;
use chrono::{DateTime, FixedOffset};
use log::{debug, info};
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Polling,
    Writing,
    RollupCheck,
    Faulted,
}

pub struct Sampler<'a> {
    device: &'a dyn DeviceClient,
    sink: &'a mut dyn TimeSeriesSink,
    clock: &'a dyn Clock,
    rollups: Arc<Rollups>,
    poller: Poller,
    boundaries: BoundaryDetector,
    /// Boundaries seen but not yet rolled up, with the time they were seen.
    pending: VecDeque<(Tier, DateTime<FixedOffset>)>,
    source_tag: String,
    destination: String,
    inverter_tags: InverterTags,
    phase: Phase,
}

impl<'a> Sampler<'a> {
    pub fn new(
        cfg: &Config,
        device: &'a dyn DeviceClient,
        sink: &'a mut dyn TimeSeriesSink,
        clock: &'a dyn Clock,
        rollups: Arc<Rollups>,
    ) -> Self {
        Sampler {
            device,
            sink,
            clock,
            rollups,
            poller: Poller::new(Cadence::new(cfg.sample_interval, cfg.battery_sample_ratio)),
            boundaries: BoundaryDetector::new(&clock.now()),
            pending: VecDeque::new(),
            source_tag: cfg.source_tag.clone(),
            destination: cfg.destinations.high_rate.clone(),
            inverter_tags: cfg.inverter_tags.clone(),
            phase: Phase::Idle,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn counters(&self) -> &FaultCounters {
        self.poller.counters()
    }

    /// Runs cycles until one fails beyond recovery.
    pub fn run(&mut self) -> Result<(), SamplingError> {
        info!("Sampling loop started");
        loop {
            if let Err(e) = self.cycle() {
                self.phase = Phase::Faulted;
                return Err(e);
            }
        }
    }

    pub fn cycle(&mut self) -> Result<(), SamplingError> {
        self.phase = Phase::Polling;
        let ts = self.poller.pace(self.clock);
        let data = match self.poller.poll(self.device, ts)? {
            PollOutcome::Ready(data) => data,
            // Stays in Polling; the next cycle retries.
            PollOutcome::Skipped => return Ok(()),
        };

        if let Some(net) = &data.snapshot.net_consumption {
            debug!("Net consumption {:.1} W (pf {:.2})", net.active_power(), net.power_factor());
        }

        self.phase = Phase::Writing;
        let points = HighRatePoints {
            source_tag: &self.source_tag,
            inverter_tags: &self.inverter_tags,
        }
        .build(&data);

        let persisted = self.write_high_rate(&points).and_then(|()| {
            self.phase = Phase::RollupCheck;
            self.check_rollups()
        });
        match persisted {
            Ok(()) => self.poller.counters_mut().record_success(),
            Err(e) => {
                self.poller.counters_mut().record_persist_failure(e)?;
                self.clock.sleep(RECOVERY_PAUSE);
            }
        }
        self.phase = Phase::Idle;
        Ok(())
    }

    fn write_high_rate(&mut self, points: &[Point]) -> Result<(), PersistError> {
        if points.is_empty() {
            debug!("No high-rate points this cycle");
            return Ok(());
        }
        self.sink.write(&self.destination, points)?;
        debug!("Wrote {} high-rate point(s)", points.len());
        Ok(())
    }

    /// Rolls up every boundary seen so far; a failed rollup stays queued for the next cycle.
    fn check_rollups(&mut self) -> Result<(), PersistError> {
        let now = self.clock.now();
        if self.boundaries.hour_rolled_over(&now) {
            self.pending.push_back((Tier::Hourly, now));
        }
        if self.boundaries.date_rolled_over(&now) {
            self.pending.push_back((Tier::Daily, now));
        }

        while let Some(&(tier, seen_at)) = self.pending.front() {
            let outcome = self.rollups.run(tier, &seen_at, &mut *self.sink)?;
            debug!("{} rollup after boundary at {}: {:?}", tier.label(), seen_at, outcome);
            self.pending.pop_front();
        }
        Ok(())
    }
}
