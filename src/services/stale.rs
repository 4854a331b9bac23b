//! Drops inverter readings that did not change since the previous poll.
//!
//! The gateway serves the last report of each inverter until a new one arrives (every few
//! minutes), and its `lastReportDate` is unreliable, so a reading only counts as new when the
//! whole raw record differs from the previous poll's record for that serial.

use crate::models::envoy::InverterReading;
use crate::models::sample::InverterSample;
use chrono::{DateTime, Utc};
use log::debug;
use std::collections::BTreeMap;

/// Serials of `current` whose raw record is absent from or different in `previous`.
///
/// With no previous snapshot there is nothing to compare to, so nothing is new.
pub fn filter_new_inverter_data(
    current: &[InverterReading],
    previous: Option<&[InverterReading]>,
    ts: DateTime<Utc>,
) -> BTreeMap<String, InverterSample> {
    let Some(previous) = previous else {
        return BTreeMap::new();
    };
    let previous = previous
        .iter()
        .map(|r| (r.serial_number.as_str(), r))
        .collect::<BTreeMap<_, _>>();

    current
        .iter()
        .filter(|r| previous.get(r.serial_number.as_str()) != Some(r))
        .map(|r| (r.serial_number.clone(), InverterSample::from_reading(r, ts)))
        .collect()
}

/// Keeps the previous raw inverter snapshot between poll cycles.
#[derive(Debug, Default)]
pub struct StaleFilter {
    previous: Option<Vec<InverterReading>>,
}

impl StaleFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filters `current` against the stored snapshot, then stores `current` unconditionally.
    pub fn filter(&mut self, current: Vec<InverterReading>, ts: DateTime<Utc>) -> BTreeMap<String, InverterSample> {
        let fresh = filter_new_inverter_data(&current, self.previous.as_deref(), ts);
        if !fresh.is_empty() {
            debug!("Got {} unique inverter measurement(s)", fresh.len());
        }
        self.previous = Some(current);
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn load_fixture() -> Vec<InverterReading> {
        let json = std::fs::read_to_string("tests/data/inverters.json").expect("fixture present");
        serde_json::from_str(&json).expect("parse inverters")
    }

    #[test]
    fn first_poll_yields_nothing() {
        let current = load_fixture();
        assert!(!current.is_empty());
        assert!(filter_new_inverter_data(&current, None, ts()).is_empty());
    }

    #[test]
    fn identical_snapshots_yield_nothing() {
        let current = load_fixture();
        assert!(filter_new_inverter_data(&current, Some(&current), ts()).is_empty());
    }

    #[test]
    fn only_changed_serials_are_returned() {
        let previous = load_fixture();
        let mut current = previous.clone();
        current[0].last_report_watts = 240.0;
        // Same timestamp, different payload still counts as new.
        current[2].max_report_watts = Some(291.0);

        let fresh = filter_new_inverter_data(&current, Some(&previous), ts());
        assert_eq!(
            fresh.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["482101000001", "482101000003"]
        );
        let sample = &fresh["482101000001"];
        assert_eq!(sample.watts, 240.0);
        assert_eq!(sample.ts, ts());
        assert_eq!(sample.last_report_date, 1_700_000_000);
    }

    #[test]
    fn unknown_keys_take_part_in_the_comparison() {
        let previous = load_fixture();
        let mut current = previous.clone();
        current[1]
            .extra
            .insert("producing".to_string(), serde_json::Value::Bool(true));

        let fresh = filter_new_inverter_data(&current, Some(&previous), ts());
        assert_eq!(fresh.keys().collect::<Vec<_>>(), vec!["482101000002"]);
    }

    #[test]
    fn newly_appearing_serial_is_new() {
        let mut previous = load_fixture();
        let current = previous.clone();
        previous.pop();

        let fresh = filter_new_inverter_data(&current, Some(&previous), ts());
        assert_eq!(fresh.keys().collect::<Vec<_>>(), vec!["482101000003"]);
    }

    #[test]
    fn filter_always_replaces_previous_snapshot() {
        let mut filter = StaleFilter::new();
        let first = load_fixture();
        assert!(filter.filter(first.clone(), ts()).is_empty());

        let mut second = first.clone();
        second[0].last_report_watts = 1.0;
        assert_eq!(filter.filter(second.clone(), ts()).len(), 1);

        // Unchanged since the second poll, even though it differs from the first.
        assert!(filter.filter(second, ts()).is_empty());
    }
}
