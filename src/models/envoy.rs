//! Raw payload shapes served by the gateway's local API.
//!
//! Scope: types only. Conversion into typed samples lives in `models::sample`.
//!
//! Notes
//! - Per-line readings are required to be complete; a missing counter is a decode error.
//! - Inverter records keep unknown keys so that equality covers the full record.
//! - Battery records are loosely structured on the wire, so every field is optional here
//!   and validated when a sample is built.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const KIND_EIM: &str = "eim";

pub const MEASUREMENT_PRODUCTION: &str = "production";
pub const MEASUREMENT_TOTAL_CONSUMPTION: &str = "total-consumption";
pub const MEASUREMENT_NET_CONSUMPTION: &str = "net-consumption";

pub const ENSEMBLE_ENCHARGE: &str = "ENCHARGE";

/// `GET /production.json?details=1`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProductionReport {
    #[serde(default)]
    pub production: Vec<MeterReport>,
    #[serde(default)]
    pub consumption: Vec<MeterReport>,
}

/// One tagged entry of the production report, e.g. `{"type": "eim", "measurementType": "production"}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterReport {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub measurement_type: Option<String>,
    #[serde(default)]
    pub lines: Vec<LineReading>,
}

impl MeterReport {
    pub fn is_eim(&self, measurement_type: &str) -> bool {
        self.kind == KIND_EIM && self.measurement_type.as_deref() == Some(measurement_type)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineReading {
    pub w_now: f64,
    pub rms_current: f64,
    pub rms_voltage: f64,
    pub react_pwr: f64,
    pub apprnt_pwr: f64,

    pub wh_today: f64,
    pub vah_today: f64,
    pub varh_lag_today: f64,
    pub varh_lead_today: f64,

    pub wh_lifetime: f64,
    pub vah_lifetime: f64,
    pub varh_lag_lifetime: f64,
    pub varh_lead_lifetime: f64,

    pub wh_last_seven_days: f64,
}

/// One element of `GET /api/v1/production/inverters`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InverterReading {
    pub serial_number: String,
    /// Unix seconds, device clock.
    pub last_report_date: i64,
    pub last_report_watts: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_type: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_report_watts: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One element of `GET /ivp/ensemble/inventory`.
#[derive(Debug, Clone, Deserialize)]
pub struct EnsembleGroup {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub devices: Vec<BatteryDevice>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BatteryDevice {
    #[serde(default)]
    pub serial_num: Option<String>,
    #[serde(default, rename = "percentFull")]
    pub percent_full: Option<f64>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default, rename = "maxCellTemp")]
    pub max_cell_temp: Option<f64>,
    #[serde(default)]
    pub led_status: Option<f64>,
    #[serde(default)]
    pub encharge_capacity: Option<f64>,
}
