//! In-memory stand-ins for the gateway, the store and the clock.

use crate::client::{DeviceClient, DeviceError};
use crate::db::models::AggregateRow;
use crate::db::point::Point;
use crate::db::sink::{AggregateQuery, PersistError, TimeSeriesSink};
use crate::models::envoy::{EnsembleGroup, InverterReading, ProductionReport};
use crate::utils::Clock;
use chrono::{DateTime, FixedOffset};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn fixture<T: serde::de::DeserializeOwned>(name: &str) -> T {
    let body = std::fs::read_to_string(format!("tests/data/{}", name)).unwrap();
    serde_json::from_str(&body).unwrap()
}

/// Time only moves when slept on, plus an optional tick per reading.
pub struct FakeClock {
    now: Cell<DateTime<FixedOffset>>,
    tick: Duration,
    slept: RefCell<Vec<Duration>>,
}

impl FakeClock {
    pub fn at(rfc3339: &str) -> Self {
        FakeClock {
            now: Cell::new(DateTime::parse_from_rfc3339(rfc3339).unwrap()),
            tick: Duration::ZERO,
            slept: RefCell::new(Vec::new()),
        }
    }

    /// Advances the clock by `tick` before every reading, as if work took that long.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn slept(&self) -> Vec<Duration> {
        self.slept.borrow().clone()
    }

    fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + chrono::Duration::from_std(by).unwrap());
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<FixedOffset> {
        self.advance(self.tick);
        self.now.get()
    }

    fn sleep(&self, duration: Duration) {
        self.slept.borrow_mut().push(duration);
        self.advance(duration);
    }
}

/// Serves the fixtures under `tests/data`, with scripted failures.
pub struct FakeDevice {
    report: ProductionReport,
    inverters: Vec<InverterReading>,
    inventory: Vec<EnsembleGroup>,
    changing_inverters: bool,
    snapshot_timeouts: Cell<u32>,
    battery_timeouts: Cell<u32>,
    snapshot_error: RefCell<Option<DeviceError>>,
    snapshot_calls: Cell<u32>,
    inverter_calls: Cell<u32>,
    battery_calls: Cell<u32>,
}

impl FakeDevice {
    pub fn new() -> Self {
        FakeDevice {
            report: fixture("production.json"),
            inverters: fixture("inverters.json"),
            inventory: fixture("inventory.json"),
            changing_inverters: false,
            snapshot_timeouts: Cell::new(0),
            battery_timeouts: Cell::new(0),
            snapshot_error: RefCell::new(None),
            snapshot_calls: Cell::new(0),
            inverter_calls: Cell::new(0),
            battery_calls: Cell::new(0),
        }
    }

    /// Every inverter reports anew on each request.
    pub fn with_changing_inverters(mut self) -> Self {
        self.changing_inverters = true;
        self
    }

    pub fn with_inventory(mut self, json: &str) -> Self {
        self.inventory = serde_json::from_str(json).unwrap();
        self
    }

    pub fn fail_snapshot_with_timeout(&self, times: u32) {
        self.snapshot_timeouts.set(times);
    }

    pub fn fail_batteries_with_timeout(&self, times: u32) {
        self.battery_timeouts.set(times);
    }

    /// The next snapshot request fails with `err`.
    pub fn fail_snapshot_with(&self, err: DeviceError) {
        self.snapshot_error.replace(Some(err));
    }

    pub fn snapshot_calls(&self) -> u32 {
        self.snapshot_calls.get()
    }

    pub fn inverter_calls(&self) -> u32 {
        self.inverter_calls.get()
    }

    pub fn battery_calls(&self) -> u32 {
        self.battery_calls.get()
    }
}

fn take_timeout(remaining: &Cell<u32>, what: &str) -> Result<(), DeviceError> {
    match remaining.get() {
        0 => Ok(()),
        n => {
            remaining.set(n - 1);
            Err(DeviceError::Timeout(format!("{} read timed out", what)))
        }
    }
}

impl DeviceClient for FakeDevice {
    fn fetch_snapshot(&self) -> Result<ProductionReport, DeviceError> {
        self.snapshot_calls.set(self.snapshot_calls.get() + 1);
        if let Some(err) = self.snapshot_error.take() {
            return Err(err);
        }
        take_timeout(&self.snapshot_timeouts, "production")?;
        Ok(self.report.clone())
    }

    fn fetch_inverters(&self) -> Result<Vec<InverterReading>, DeviceError> {
        let call = self.inverter_calls.get() + 1;
        self.inverter_calls.set(call);
        let mut inverters = self.inverters.clone();
        if self.changing_inverters {
            for inverter in &mut inverters {
                inverter.last_report_date += i64::from(call) * 10;
            }
        }
        Ok(inverters)
    }

    fn fetch_batteries(&self) -> Result<Vec<EnsembleGroup>, DeviceError> {
        self.battery_calls.set(self.battery_calls.get() + 1);
        take_timeout(&self.battery_timeouts, "inventory")?;
        Ok(self.inventory.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SinkLog {
    pub writes: Vec<(String, Vec<Point>)>,
    pub queries: Vec<&'static str>,
}

/// Records writes and answers aggregate queries with canned rows.
///
/// Clones share one log, so a clone handed to the code under test can be inspected through
/// the original.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    log: Arc<Mutex<SinkLog>>,
    pub integral_rows: Vec<AggregateRow>,
    pub soc_rows: Vec<AggregateRow>,
    pub temperature_rows: Vec<AggregateRow>,
    /// Keyed by counter source tag.
    pub counter_rows: BTreeMap<String, Vec<AggregateRow>>,
    pub failing_writes: u32,
    pub failing_queries: u32,
    pub query_delay: Option<Duration>,
}

impl MemorySink {
    pub fn log(&self) -> SinkLog {
        self.log.lock().unwrap().clone()
    }

    pub fn writes_to(&self, destination: &str) -> Vec<Vec<Point>> {
        self.log
            .lock()
            .unwrap()
            .writes
            .iter()
            .filter(|(d, _)| d == destination)
            .map(|(_, points)| points.clone())
            .collect()
    }
}

impl TimeSeriesSink for MemorySink {
    fn write(&mut self, destination: &str, points: &[Point]) -> Result<(), PersistError> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(PersistError::Connection("store unavailable".into()));
        }
        self.log
            .lock()
            .unwrap()
            .writes
            .push((destination.to_string(), points.to_vec()));
        Ok(())
    }

    fn query(&mut self, query: &AggregateQuery<'_>) -> Result<Vec<AggregateRow>, PersistError> {
        if self.failing_queries > 0 {
            self.failing_queries -= 1;
            return Err(PersistError::Query("store unavailable".into()));
        }
        if let Some(delay) = self.query_delay {
            std::thread::sleep(delay);
        }
        let (name, rows) = match query {
            AggregateQuery::PowerIntegral { .. } => ("PowerIntegral", self.integral_rows.clone()),
            AggregateQuery::BatterySoc { .. } => ("BatterySoc", self.soc_rows.clone()),
            AggregateQuery::BatteryTemperature { .. } => ("BatteryTemperature", self.temperature_rows.clone()),
            AggregateQuery::CounterSpread { source, .. } => (
                "CounterSpread",
                self.counter_rows.get(*source).cloned().unwrap_or_default(),
            ),
        };
        self.log.lock().unwrap().queries.push(name);
        Ok(rows)
    }
}
