//! One poll cycle against the gateway plus the bounded-retry bookkeeping around device and
//! store failures.

use crate::client::{DeviceClient, DeviceError};
use crate::db::sink::PersistError;
use crate::models::sample::{BatteriesSample, InverterSample, SampleSnapshot};
use crate::services::cadence::Cadence;
use crate::services::stale::StaleFilter;
use crate::utils::Clock;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

/// Consecutive failures of one kind after which the run is given up.
pub const ESCALATION_CEILING: u32 = 10;

/// Pause after a failed persist so the store can recover.
pub const RECOVERY_PAUSE: Duration = Duration::from_secs(50);

/// Conditions that end a sampling run.
#[derive(Debug)]
pub enum SamplingError {
    TimeoutsExhausted { last: DeviceError },
    PersistExhausted { last: PersistError },
    Device(DeviceError),
}

impl Display for SamplingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SamplingError::TimeoutsExhausted { last } => write!(
                f,
                "gateway timed out {} times in a row, last: {}",
                ESCALATION_CEILING, last
            ),
            SamplingError::PersistExhausted { last } => write!(
                f,
                "persisting failed {} times in a row, last: {}",
                ESCALATION_CEILING, last
            ),
            SamplingError::Device(e) => write!(f, "gateway request failed: {}", e),
        }
    }
}

impl std::error::Error for SamplingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SamplingError::TimeoutsExhausted { last } => Some(last),
            SamplingError::PersistExhausted { last } => Some(last),
            SamplingError::Device(e) => Some(e),
        }
    }
}

/// Consecutive-failure counters. Each kind escalates on its own; a full success resets both.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FaultCounters {
    timeouts: u32,
    persist_failures: u32,
}

impl FaultCounters {
    pub fn timeouts(&self) -> u32 {
        self.timeouts
    }

    pub fn persist_failures(&self) -> u32 {
        self.persist_failures
    }

    pub fn record_timeout(&mut self, err: DeviceError) -> Result<(), SamplingError> {
        self.timeouts += 1;
        warn!(
            "Gateway request timed out ({}/{}): {}",
            self.timeouts, ESCALATION_CEILING, err
        );
        if self.timeouts >= ESCALATION_CEILING {
            return Err(SamplingError::TimeoutsExhausted { last: err });
        }
        Ok(())
    }

    pub fn record_persist_failure(&mut self, err: PersistError) -> Result<(), SamplingError> {
        self.persist_failures += 1;
        warn!(
            "Persisting cycle failed ({}/{}): {}",
            self.persist_failures, ESCALATION_CEILING, err
        );
        if self.persist_failures >= ESCALATION_CEILING {
            return Err(SamplingError::PersistExhausted { last: err });
        }
        Ok(())
    }

    pub fn record_success(&mut self) {
        self.timeouts = 0;
        self.persist_failures = 0;
    }
}

/// Everything fetched in one cycle, stamped with the same capture time.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleData {
    pub ts: DateTime<Utc>,
    pub snapshot: SampleSnapshot,
    pub inverters: BTreeMap<String, InverterSample>,
    pub batteries: Option<BatteriesSample>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Ready(CycleData),
    /// A transient timeout below the ceiling; nothing is written this cycle.
    Skipped,
}

pub struct Poller {
    cadence: Cadence,
    stale: StaleFilter,
    counters: FaultCounters,
}

impl Poller {
    pub fn new(cadence: Cadence) -> Self {
        Poller {
            cadence,
            stale: StaleFilter::new(),
            counters: FaultCounters::default(),
        }
    }

    pub fn counters(&self) -> &FaultCounters {
        &self.counters
    }

    pub fn counters_mut(&mut self) -> &mut FaultCounters {
        &mut self.counters
    }

    /// Sleeps until the next interval boundary and returns the capture time of the cycle.
    pub fn pace(&self, clock: &dyn Clock) -> DateTime<Utc> {
        let delay = self.cadence.next_sample_delay(&clock.now());
        clock.sleep(delay);
        clock.now().with_timezone(&Utc)
    }

    pub fn poll(&mut self, device: &dyn DeviceClient, ts: DateTime<Utc>) -> Result<PollOutcome, SamplingError> {
        match self.fetch(device, ts) {
            Ok(data) => Ok(PollOutcome::Ready(data)),
            Err(e) if e.is_transient() => {
                self.counters.record_timeout(e)?;
                Ok(PollOutcome::Skipped)
            }
            Err(e) => Err(SamplingError::Device(e)),
        }
    }

    fn fetch(&mut self, device: &dyn DeviceClient, ts: DateTime<Utc>) -> Result<CycleData, DeviceError> {
        let report = device.fetch_snapshot()?;
        let snapshot = SampleSnapshot::from_report(&report, ts);

        let inverters = self.stale.filter(device.fetch_inverters()?, ts);

        let batteries = if self.cadence.should_sample_now() {
            let groups = device.fetch_batteries().inspect_err(|_| self.cadence.rearm())?;
            Some(BatteriesSample::from_inventory(&groups, ts))
        } else {
            None
        };

        debug!(
            "Polled gateway at {} (inverters changed={}, batteries={})",
            ts,
            inverters.len(),
            batteries.as_ref().map_or(0, |b| b.batteries.len())
        );
        Ok(CycleData {
            ts,
            snapshot,
            inverters,
            batteries,
        })
    }
}
