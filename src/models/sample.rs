//! Typed samples built from raw gateway payloads.
//!
//! Every sample is stamped with the poll-cycle timestamp taken by the sampler. Timestamps
//! embedded in the payloads come from the gateway clock, which drifts, and are not used for
//! sample identity.

use crate::models::envoy::{
    self, BatteryDevice, EnsembleGroup, InverterReading, LineReading, MeterReport, ProductionReport,
};
use chrono::{DateTime, Utc};
use log::warn;
use std::fmt::{self, Display, Formatter};

/// Apparent power below this is sensor noise; the power factor is reported as 1.0 there.
pub const APPARENT_POWER_NOISE_FLOOR_VA: f64 = 10.0;

/// Power factor with the noise floor applied.
pub fn power_factor(active_power: f64, apparent_power: f64) -> f64 {
    if apparent_power < APPARENT_POWER_NOISE_FLOOR_VA {
        1.0
    } else {
        active_power / apparent_power
    }
}

/// A payload lacks a field the write tier depends on.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedPayload(pub String);

impl Display for MalformedPayload {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "malformed payload: {}", self.0)
    }
}

impl std::error::Error for MalformedPayload {}

/// One electrical line.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerSample {
    pub ts: DateTime<Utc>,

    // Instantaneous
    pub active_power: f64,
    pub reactive_power: f64,
    pub apparent_power: f64,
    pub rms_current: f64,
    pub rms_voltage: f64,

    // Today
    pub wh_today: f64,
    pub vah_today: f64,
    pub varh_lag_today: f64,
    pub varh_lead_today: f64,

    // Lifetime
    pub wh_lifetime: f64,
    pub vah_lifetime: f64,
    pub varh_lag_lifetime: f64,
    pub varh_lead_lifetime: f64,

    pub wh_last_seven_days: f64,
}

impl PowerSample {
    pub fn from_reading(reading: &LineReading, ts: DateTime<Utc>) -> Self {
        PowerSample {
            ts,
            active_power: reading.w_now,
            reactive_power: reading.react_pwr,
            apparent_power: reading.apprnt_pwr,
            rms_current: reading.rms_current,
            rms_voltage: reading.rms_voltage,
            wh_today: reading.wh_today,
            vah_today: reading.vah_today,
            varh_lag_today: reading.varh_lag_today,
            varh_lead_today: reading.varh_lead_today,
            wh_lifetime: reading.wh_lifetime,
            vah_lifetime: reading.vah_lifetime,
            varh_lag_lifetime: reading.varh_lag_lifetime,
            varh_lead_lifetime: reading.varh_lead_lifetime,
            wh_last_seven_days: reading.wh_last_seven_days,
        }
    }

    /// Computed locally; the gateway's own figure is derived from a miscalculated apparent power.
    pub fn power_factor(&self) -> f64 {
        power_factor(self.active_power, self.apparent_power)
    }
}

macro_rules! summed {
    ($($name:ident),+ $(,)?) => {
        $(
            pub fn $name(&self) -> f64 {
                self.sum(|line| line.$name)
            }
        )+
    };
}

/// An "eim" measurement spanning several lines. Totals are summed on demand.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateElectricalSample {
    ts: DateTime<Utc>,
    lines: Vec<PowerSample>,
}

impl AggregateElectricalSample {
    pub fn new(ts: DateTime<Utc>, lines: Vec<PowerSample>) -> Self {
        AggregateElectricalSample { ts, lines }
    }

    pub fn from_report(report: &MeterReport, ts: DateTime<Utc>) -> Self {
        let lines = report
            .lines
            .iter()
            .map(|reading| PowerSample::from_reading(reading, ts))
            .collect();
        AggregateElectricalSample::new(ts, lines)
    }

    pub fn ts(&self) -> DateTime<Utc> {
        self.ts
    }

    pub fn lines(&self) -> &[PowerSample] {
        &self.lines
    }

    fn sum(&self, field: impl Fn(&PowerSample) -> f64) -> f64 {
        self.lines.iter().map(field).sum()
    }

    summed!(
        active_power,
        reactive_power,
        apparent_power,
        rms_current,
        rms_voltage,
        wh_today,
        vah_today,
        varh_lag_today,
        varh_lead_today,
        wh_lifetime,
        vah_lifetime,
        varh_lag_lifetime,
        varh_lead_lifetime,
        wh_last_seven_days,
    );

    pub fn power_factor(&self) -> f64 {
        power_factor(self.active_power(), self.apparent_power())
    }
}

/// Everything the main snapshot yields in one poll cycle.
///
/// A measurement type missing from the payload stays `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleSnapshot {
    pub ts: DateTime<Utc>,
    pub net_consumption: Option<AggregateElectricalSample>,
    pub total_consumption: Option<AggregateElectricalSample>,
    pub total_production: Option<AggregateElectricalSample>,
}

impl SampleSnapshot {
    pub fn from_report(report: &ProductionReport, ts: DateTime<Utc>) -> Self {
        let pick = |reports: &[MeterReport], measurement_type: &str| {
            reports
                .iter()
                .find(|r| r.is_eim(measurement_type))
                .map(|r| AggregateElectricalSample::from_report(r, ts))
        };

        // Inverter-typed production entries carry no per-line detail and are skipped here;
        // per-inverter power comes from the inverter endpoint instead.
        SampleSnapshot {
            ts,
            net_consumption: pick(&report.consumption, envoy::MEASUREMENT_NET_CONSUMPTION),
            total_consumption: pick(&report.consumption, envoy::MEASUREMENT_TOTAL_CONSUMPTION),
            total_production: pick(&report.production, envoy::MEASUREMENT_PRODUCTION),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InverterSample {
    pub ts: DateTime<Utc>,
    pub serial: String,
    pub watts: f64,
    /// As reported by the gateway clock.
    pub last_report_date: i64,
}

impl InverterSample {
    pub fn from_reading(reading: &InverterReading, ts: DateTime<Utc>) -> Self {
        InverterSample {
            ts,
            serial: reading.serial_number.clone(),
            watts: reading.last_report_watts,
            last_report_date: reading.last_report_date,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatteryUnit {
    pub serial: String,
    pub percent_full: f64,
    pub temperature: f64,
    pub max_cell_temp: Option<f64>,
    pub led_status: Option<f64>,
    pub capacity_wh: Option<f64>,
}

impl TryFrom<&BatteryDevice> for BatteryUnit {
    type Error = MalformedPayload;

    fn try_from(device: &BatteryDevice) -> Result<Self, Self::Error> {
        let serial = device
            .serial_num
            .clone()
            .ok_or_else(|| MalformedPayload("battery record without serial_num".to_string()))?;
        let percent_full = device
            .percent_full
            .ok_or_else(|| MalformedPayload(format!("battery {serial} without percentFull")))?;
        let temperature = device
            .temperature
            .ok_or_else(|| MalformedPayload(format!("battery {serial} without temperature")))?;
        Ok(BatteryUnit {
            serial,
            percent_full,
            temperature,
            max_cell_temp: device.max_cell_temp,
            led_status: device.led_status,
            capacity_wh: device.encharge_capacity,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatteriesSample {
    pub ts: DateTime<Utc>,
    pub batteries: Vec<BatteryUnit>,
}

impl BatteriesSample {
    /// Collects the battery units of the storage groups in the inventory.
    ///
    /// A unit lacking a field the write tier needs is dropped; the others are kept.
    pub fn from_inventory(groups: &[EnsembleGroup], ts: DateTime<Utc>) -> Self {
        let batteries = groups
            .iter()
            .filter(|g| g.kind == envoy::ENSEMBLE_ENCHARGE)
            .flat_map(|g| g.devices.iter())
            .filter_map(|device| match BatteryUnit::try_from(device) {
                Ok(unit) => Some(unit),
                Err(e) => {
                    warn!("Skipping battery record: {}", e);
                    None
                }
            })
            .collect();
        BatteriesSample { ts, batteries }
    }
}
