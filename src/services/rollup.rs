//! Hourly and daily rollups.
//!
//! A rollup summarises the window that ended at the most recent hour or day boundary:
//! watt-hours per line and inverter (time integral of the high-rate `P` field), battery charge
//! and temperature statistics, and watt-hours from foreign counter sources. Rollup points are
//! stamped with the window start.
//!
//! [`Rollups::run`] is the only entry point. It is shared by the sampling loop and the optional
//! scheduler thread, holds a lock for the whole computation and remembers the recent windows
//! handled per tier, so each window is summarised at most once per process.

use crate::config::{Config, CounterSource, Destinations, InverterTags};
use crate::db::point::{Point, tags};
use crate::db::sink::{AggregateQuery, PersistError, TimeSeriesSink, Window};
use crate::services::highrate::{CATEGORY_BATTERY, CATEGORY_INVERTER};
use crate::utils::{start_of_day, start_of_hour};
use chrono::{DateTime, FixedOffset, Utc};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Hourly,
    Daily,
}

impl Tier {
    pub fn label(self) -> &'static str {
        match self {
            Tier::Hourly => "hourly",
            Tier::Daily => "daily",
        }
    }

    fn interval_tag(self) -> &'static str {
        match self {
            Tier::Hourly => "1h",
            Tier::Daily => "24h",
        }
    }

    /// The complete hour or local day that ended at or before `now`.
    pub fn window_before(self, now: &DateTime<FixedOffset>) -> Window {
        let (start, end) = match self {
            Tier::Hourly => {
                let end = start_of_hour(now);
                (end - chrono::Duration::hours(1), end)
            }
            Tier::Daily => {
                let end = start_of_day(now);
                (end - chrono::Duration::days(1), end)
            }
        };
        Window {
            start: start.with_timezone(&Utc),
            end: end.with_timezone(&Utc),
        }
    }
}

/// What the rollups compute and where they write.
#[derive(Debug, Clone)]
pub struct RollupPlan {
    pub source_tag: String,
    pub destinations: Destinations,
    pub hourly_enabled: bool,
    pub daily_enabled: bool,
    pub inverter_tags: InverterTags,
    pub counter_sources: Vec<CounterSource>,
}

impl RollupPlan {
    pub fn from_config(cfg: &Config) -> Self {
        RollupPlan {
            source_tag: cfg.source_tag.clone(),
            destinations: cfg.destinations.clone(),
            hourly_enabled: cfg.hourly_rollup_enabled,
            daily_enabled: cfg.daily_rollup_enabled,
            inverter_tags: cfg.inverter_tags.clone(),
            counter_sources: cfg.counter_sources.clone(),
        }
    }

    fn destination(&self, tier: Tier) -> &str {
        match tier {
            Tier::Hourly => &self.destinations.hourly,
            Tier::Daily => &self.destinations.daily,
        }
    }

    fn enabled(&self, tier: Tier) -> bool {
        match tier {
            Tier::Hourly => self.hourly_enabled,
            Tier::Daily => self.daily_enabled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollupOutcome {
    Disabled,
    AlreadyHandled,
    /// Computed, but there was nothing to write.
    Empty,
    Written(usize),
}

/// Handled windows remembered per tier, oldest dropped first.
const HANDLED_MEMORY: usize = 48;

/// Ends of the windows handled per tier.
#[derive(Debug, Default)]
struct Handled {
    hourly: BTreeSet<DateTime<Utc>>,
    daily: BTreeSet<DateTime<Utc>>,
}

impl Handled {
    fn ends(&mut self, tier: Tier) -> &mut BTreeSet<DateTime<Utc>> {
        match tier {
            Tier::Hourly => &mut self.hourly,
            Tier::Daily => &mut self.daily,
        }
    }
}

pub struct Rollups {
    plan: RollupPlan,
    handled: Mutex<Handled>,
}

impl Rollups {
    pub fn new(plan: RollupPlan) -> Self {
        Rollups {
            plan,
            handled: Mutex::new(Handled::default()),
        }
    }

    pub fn is_enabled(&self, tier: Tier) -> bool {
        self.plan.enabled(tier)
    }

    /// Summarises the window of `tier` that ended at or before `now`, unless already done.
    ///
    /// The window is only marked as handled after its points were written, so a failed
    /// rollup can be retried.
    pub fn run(
        &self,
        tier: Tier,
        now: &DateTime<FixedOffset>,
        sink: &mut dyn TimeSeriesSink,
    ) -> Result<RollupOutcome, PersistError> {
        if !self.plan.enabled(tier) {
            return Ok(RollupOutcome::Disabled);
        }
        let window = tier.window_before(now);

        // A poisoned lock only means another rollup panicked; the marks are still valid.
        let mut handled = self.handled.lock().unwrap_or_else(PoisonError::into_inner);
        let ends = handled.ends(tier);
        if ends.contains(&window.end) {
            debug!("{} rollup for window ending {} already handled", tier.label(), window.end);
            return Ok(RollupOutcome::AlreadyHandled);
        }

        let points = self.collect(tier, window, sink)?;
        let outcome = if points.is_empty() {
            RollupOutcome::Empty
        } else {
            sink.write(self.plan.destination(tier), &points)?;
            RollupOutcome::Written(points.len())
        };
        ends.insert(window.end);
        while ends.len() > HANDLED_MEMORY {
            ends.pop_first();
        }

        info!(
            "{} rollup for [{}, {}) wrote {} point(s)",
            tier.label(),
            window.start,
            window.end,
            points.len()
        );
        Ok(outcome)
    }

    fn collect(&self, tier: Tier, window: Window, sink: &mut dyn TimeSeriesSink) -> Result<Vec<Point>, PersistError> {
        let mut points = self.energy_points(tier, window, sink)?;
        points.extend(self.battery_points(tier, window, sink)?);
        for counter in &self.plan.counter_sources {
            points.extend(self.counter_points(tier, counter, window, sink)?);
        }
        Ok(points)
    }

    fn summary_point(&self, measurement: String, tier: Tier, window: Window, measurement_type: &str) -> Point {
        Point::new(measurement, window.start)
            .tag(tags::SOURCE, &self.plan.source_tag)
            .tag(tags::MEASUREMENT_TYPE, measurement_type)
            .tag(tags::INTERVAL, tier.interval_tag())
    }

    fn inverter_summary(&self, tier: Tier, window: Window, serial: &str, wh: f64) -> Point {
        let point = self
            .summary_point(
                format!("inverter-{}-summary-{}", tier.label(), serial),
                tier,
                window,
                CATEGORY_INVERTER,
            )
            .tag(tags::SERIAL, serial)
            .field("Wh", wh);
        self.plan.inverter_tags.apply(point, serial)
    }

    /// Watt-hours per line and inverter. Configured inverters that reported nothing in the
    /// window are recorded with zero production.
    fn energy_points(&self, tier: Tier, window: Window, sink: &mut dyn TimeSeriesSink) -> Result<Vec<Point>, PersistError> {
        let rows = sink.query(&AggregateQuery::PowerIntegral {
            destination: &self.plan.destinations.high_rate,
            source: &self.plan.source_tag,
            window,
        })?;

        let mut unreported = self.plan.inverter_tags.serials();
        let mut points = Vec::with_capacity(rows.len() + unreported.len());
        for row in rows {
            if row.measurement_type == CATEGORY_INVERTER {
                let Some(serial) = row.serial.as_deref() else {
                    warn!("Skipping inverter integral without serial");
                    continue;
                };
                unreported.remove(serial);
                points.push(self.inverter_summary(tier, window, serial, row.value));
            } else {
                let Some(idx) = row.line_idx else {
                    warn!("Skipping {} integral without line index", row.measurement_type);
                    continue;
                };
                let measurement = format!("{}-{}-summary-line{}", row.measurement_type, tier.label(), idx);
                points.push(
                    self.summary_point(measurement, tier, window, &row.measurement_type)
                        .tag(tags::LINE_IDX, idx)
                        .field("Wh", row.value),
                );
            }
        }

        if !unreported.is_empty() {
            debug!("{} inverter(s) did not report, recording 0 Wh", unreported.len());
        }
        points.extend(
            unreported
                .iter()
                .map(|serial| self.inverter_summary(tier, window, serial, 0.0)),
        );
        Ok(points)
    }

    /// One point per battery with `mean_soc`, `max_soc`, `min_soc` and `mean_temperature`.
    fn battery_points(&self, tier: Tier, window: Window, sink: &mut dyn TimeSeriesSink) -> Result<Vec<Point>, PersistError> {
        let destination = self.plan.destinations.high_rate.as_str();
        let source = self.plan.source_tag.as_str();
        let mut rows = sink.query(&AggregateQuery::BatterySoc {
            destination,
            source,
            window,
        })?;
        rows.extend(sink.query(&AggregateQuery::BatteryTemperature {
            destination,
            source,
            window,
        })?);

        let mut by_serial: BTreeMap<String, Point> = BTreeMap::new();
        for row in rows {
            if row.measurement_type != CATEGORY_BATTERY {
                continue;
            }
            let Some(serial) = row.serial else { continue };
            let point = by_serial.entry(serial).or_insert_with_key(|serial| {
                self.summary_point(
                    format!("battery-{}-summary-{}", tier.label(), serial),
                    tier,
                    window,
                    CATEGORY_BATTERY,
                )
                .tag(tags::SERIAL, serial)
            });
            point.fields.insert(row.result, row.value);
        }
        Ok(by_serial.into_values().collect())
    }

    fn counter_points(
        &self,
        tier: Tier,
        counter: &CounterSource,
        window: Window,
        sink: &mut dyn TimeSeriesSink,
    ) -> Result<Vec<Point>, PersistError> {
        let rows = sink.query(&AggregateQuery::CounterSpread {
            source: &counter.source_tag,
            series: &counter.series,
            window,
        })?;
        let points = rows
            .into_iter()
            .filter_map(|row| {
                let device = row.serial?;
                let point = Point::new(
                    format!("{}-{}-summary-{}", row.measurement_type, tier.label(), device),
                    window.start,
                )
                .tag(tags::SOURCE, &counter.source_tag)
                .tag(tags::MEASUREMENT_TYPE, &row.measurement_type)
                .tag(tags::SERIAL, device)
                .tag(tags::INTERVAL, tier.interval_tag())
                .field("Wh", row.value * counter.scale);
                Some(point)
            })
            .collect();
        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::AggregateRow;
    use crate::testing::MemorySink;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;
    use std::time::Duration;

    fn at(s: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(s).unwrap()
    }

    fn plan() -> RollupPlan {
        RollupPlan {
            source_tag: "home".into(),
            destinations: Destinations {
                high_rate: "high_rate".into(),
                hourly: "hourly".into(),
                daily: "daily".into(),
            },
            hourly_enabled: true,
            daily_enabled: true,
            inverter_tags: InverterTags::parse("INV-A:array=east;INV-B").unwrap(),
            counter_sources: Vec::new(),
        }
    }

    fn row(measurement_type: &str, line_idx: Option<i32>, serial: Option<&str>, result: &str, value: f64) -> AggregateRow {
        AggregateRow {
            measurement_type: measurement_type.into(),
            line_idx,
            serial: serial.map(str::to_string),
            result: result.into(),
            value,
        }
    }

    fn inverter_points<'a>(points: &'a [Point], serial: &str) -> Vec<&'a Point> {
        points
            .iter()
            .filter(|p| p.get_tag(tags::MEASUREMENT_TYPE) == Some("inverter") && p.get_tag(tags::SERIAL) == Some(serial))
            .collect()
    }

    #[test]
    fn windows_end_at_the_last_boundary() {
        let now = at("2024-03-10T10:00:07+01:00");
        let hourly = Tier::Hourly.window_before(&now);
        assert_eq!(hourly.start, at("2024-03-10T09:00:00+01:00"));
        assert_eq!(hourly.end, at("2024-03-10T10:00:00+01:00"));

        let daily = Tier::Daily.window_before(&now);
        assert_eq!(daily.start, at("2024-03-09T00:00:00+01:00"));
        assert_eq!(daily.end, at("2024-03-10T00:00:00+01:00"));
    }

    #[test]
    fn hourly_rollup_zero_fills_missing_inverters() {
        let rollups = Rollups::new(plan());
        let mut sink = MemorySink::default();
        sink.integral_rows = vec![
            row("consumption", Some(0), None, "total", 512.5),
            row("inverter", None, Some("INV-A"), "total", 120.0),
        ];

        let outcome = rollups.run(Tier::Hourly, &at("2024-03-10T10:00:07+00:00"), &mut sink).unwrap();
        assert_eq!(outcome, RollupOutcome::Written(3));

        let writes = sink.writes_to("hourly");
        assert_eq!(writes.len(), 1);
        let points = &writes[0];

        let missing = inverter_points(points, "INV-B");
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].get_field("Wh"), Some(0.0));
        assert_eq!(missing[0].measurement, "inverter-hourly-summary-INV-B");

        let reported = inverter_points(points, "INV-A");
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].get_field("Wh"), Some(120.0));
        assert_eq!(reported[0].get_tag("array"), Some("east"));

        let line = points.iter().find(|p| p.measurement == "consumption-hourly-summary-line0").unwrap();
        assert_eq!(line.get_tag(tags::INTERVAL), Some("1h"));
        assert_eq!(line.get_tag(tags::LINE_IDX), Some("0"));
        assert_eq!(line.time, at("2024-03-10T09:00:00+00:00"));
    }

    #[test]
    fn empty_results_still_zero_fill_configured_inverters() {
        let rollups = Rollups::new(plan());
        let mut sink = MemorySink::default();

        let outcome = rollups.run(Tier::Daily, &at("2024-03-10T00:00:03+00:00"), &mut sink).unwrap();
        assert_eq!(outcome, RollupOutcome::Written(2));
        let points = &sink.writes_to("daily")[0];
        assert!(points.iter().all(|p| p.get_field("Wh") == Some(0.0)));
        assert!(points.iter().all(|p| p.get_tag(tags::INTERVAL) == Some("24h")));
    }

    #[test]
    fn nothing_to_report_means_no_write() {
        let mut plan = plan();
        plan.inverter_tags = InverterTags::default();
        let rollups = Rollups::new(plan);
        let mut sink = MemorySink::default();

        let outcome = rollups.run(Tier::Hourly, &at("2024-03-10T10:00:07+00:00"), &mut sink).unwrap();
        assert_eq!(outcome, RollupOutcome::Empty);
        assert!(sink.log().writes.is_empty());
        assert_eq!(
            sink.log().queries,
            vec!["PowerIntegral", "BatterySoc", "BatteryTemperature"]
        );
    }

    #[test]
    fn battery_statistics_merge_into_one_point_per_unit() {
        let rollups = Rollups::new(plan());
        let mut sink = MemorySink::default();
        sink.soc_rows = vec![
            row("battery", None, Some("B1"), "mean_soc", 55.0),
            row("battery", None, Some("B1"), "max_soc", 80.0),
            row("battery", None, Some("B1"), "min_soc", 30.0),
        ];
        sink.temperature_rows = vec![row("battery", None, Some("B1"), "mean_temperature", 21.5)];

        rollups.run(Tier::Hourly, &at("2024-03-10T10:00:07+00:00"), &mut sink).unwrap();
        let points = &sink.writes_to("hourly")[0];
        let battery = points.iter().find(|p| p.measurement == "battery-hourly-summary-B1").unwrap();
        assert_eq!(
            battery.fields,
            BTreeMap::from([
                ("max_soc".to_string(), 80.0),
                ("mean_soc".to_string(), 55.0),
                ("mean_temperature".to_string(), 21.5),
                ("min_soc".to_string(), 30.0),
            ])
        );
    }

    #[test]
    fn counter_sources_are_scaled_and_tagged_with_their_identity() {
        let mut plan = plan();
        plan.inverter_tags = InverterTags::default();
        plan.counter_sources = vec![CounterSource {
            source_tag: "balkonkraftwerk".into(),
            series: vec!["inverter/HM-800/ch0/YieldTotal".into()],
            scale: 1000.0,
        }];
        let rollups = Rollups::new(plan);
        let mut sink = MemorySink::default();
        sink.counter_rows.insert(
            "balkonkraftwerk".into(),
            vec![row("inverter/HM-800/ch0/YieldTotal", None, Some("dtu"), "spread", 0.25)],
        );

        rollups.run(Tier::Daily, &at("2024-03-10T00:00:03+00:00"), &mut sink).unwrap();
        let points = &sink.writes_to("daily")[0];
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].get_field("Wh"), Some(250.0));
        assert_eq!(points[0].get_tag(tags::SOURCE), Some("balkonkraftwerk"));
        assert_eq!(points[0].get_tag(tags::SERIAL), Some("dtu"));
    }

    #[test]
    fn a_window_is_rolled_up_once() {
        let rollups = Rollups::new(plan());
        let mut sink = MemorySink::default();
        let now = at("2024-03-10T10:00:07+00:00");

        assert!(matches!(rollups.run(Tier::Hourly, &now, &mut sink), Ok(RollupOutcome::Written(_))));
        let later_same_hour = at("2024-03-10T10:40:00+00:00");
        assert_eq!(
            rollups.run(Tier::Hourly, &later_same_hour, &mut sink).unwrap(),
            RollupOutcome::AlreadyHandled
        );
        assert_eq!(sink.writes_to("hourly").len(), 1);

        // Daily is tracked separately.
        assert!(matches!(rollups.run(Tier::Daily, &now, &mut sink), Ok(RollupOutcome::Written(_))));
    }

    #[test]
    fn older_pending_window_runs_after_a_newer_one() {
        let rollups = Rollups::new(plan());
        let mut sink = MemorySink::default();

        assert!(matches!(
            rollups.run(Tier::Hourly, &at("2024-03-10T11:00:07+00:00"), &mut sink),
            Ok(RollupOutcome::Written(_))
        ));
        assert!(matches!(
            rollups.run(Tier::Hourly, &at("2024-03-10T10:00:07+00:00"), &mut sink),
            Ok(RollupOutcome::Written(_))
        ));
        let starts = sink
            .writes_to("hourly")
            .iter()
            .map(|points| points[0].time.to_rfc3339())
            .collect::<Vec<_>>();
        assert_eq!(starts, vec!["2024-03-10T10:00:00+00:00", "2024-03-10T09:00:00+00:00"]);
        assert_eq!(
            rollups.run(Tier::Hourly, &at("2024-03-10T10:30:00+00:00"), &mut sink).unwrap(),
            RollupOutcome::AlreadyHandled
        );
    }

    #[test]
    fn handled_windows_are_bounded() {
        let rollups = Rollups::new(plan());
        let mut sink = MemorySink::default();
        let first = at("2024-03-10T00:00:07+00:00");
        for hour in 0..=HANDLED_MEMORY as i64 {
            rollups.run(Tier::Hourly, &(first + chrono::Duration::hours(hour)), &mut sink).unwrap();
        }
        let handled = rollups.handled.lock().unwrap();
        assert_eq!(handled.hourly.len(), HANDLED_MEMORY);
        assert!(!handled.hourly.contains(&at("2024-03-10T00:00:00+00:00").with_timezone(&Utc)));
    }

    #[test]
    fn failed_rollup_is_not_marked_handled() {
        let rollups = Rollups::new(plan());
        let mut sink = MemorySink::default();
        sink.failing_queries = 1;
        let now = at("2024-03-10T10:00:07+00:00");

        assert!(rollups.run(Tier::Hourly, &now, &mut sink).is_err());
        assert!(matches!(rollups.run(Tier::Hourly, &now, &mut sink), Ok(RollupOutcome::Written(_))));
    }

    #[test]
    fn disabled_tier_does_nothing() {
        let mut plan = plan();
        plan.daily_enabled = false;
        let rollups = Rollups::new(plan);
        let mut sink = MemorySink::default();

        assert_eq!(
            rollups.run(Tier::Daily, &at("2024-03-10T00:00:03+00:00"), &mut sink).unwrap(),
            RollupOutcome::Disabled
        );
        assert!(sink.log().queries.is_empty());
    }

    #[test]
    fn concurrent_triggers_roll_up_a_window_once() {
        let rollups = Arc::new(Rollups::new(plan()));
        let mut template = MemorySink::default();
        template.query_delay = Some(Duration::from_millis(20));
        let now = at("2024-03-10T10:00:07+00:00");

        let handles = (0..4)
            .map(|_| {
                let rollups = Arc::clone(&rollups);
                let mut sink = template.clone();
                std::thread::spawn(move || rollups.run(Tier::Hourly, &now, &mut sink).unwrap())
            })
            .collect::<Vec<_>>();
        let outcomes = handles.into_iter().map(|h| h.join().unwrap()).collect::<Vec<_>>();

        assert_eq!(outcomes.iter().filter(|o| matches!(o, RollupOutcome::Written(_))).count(), 1);
        assert_eq!(outcomes.iter().filter(|o| **o == RollupOutcome::AlreadyHandled).count(), 3);
        assert_eq!(template.writes_to("hourly").len(), 1);
    }
}
