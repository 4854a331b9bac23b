//! High-rate tier: one point per line, changed inverter and battery unit per cycle.
//!
//! Values are written as sampled; nothing is derived at this tier.

use crate::config::InverterTags;
use crate::db::point::{Point, tags};
use crate::models::sample::{AggregateElectricalSample, BatteriesSample, InverterSample, PowerSample};
use crate::services::poller::CycleData;

pub const CATEGORY_CONSUMPTION: &str = "consumption";
pub const CATEGORY_PRODUCTION: &str = "production";
pub const CATEGORY_NET: &str = "net";
pub const CATEGORY_INVERTER: &str = "inverter";
pub const CATEGORY_BATTERY: &str = "battery";

pub struct HighRatePoints<'a> {
    pub source_tag: &'a str,
    pub inverter_tags: &'a InverterTags,
}

impl HighRatePoints<'_> {
    pub fn build(&self, data: &CycleData) -> Vec<Point> {
        let mut points = Vec::new();
        let aggregates = [
            (CATEGORY_CONSUMPTION, &data.snapshot.total_consumption),
            (CATEGORY_PRODUCTION, &data.snapshot.total_production),
            (CATEGORY_NET, &data.snapshot.net_consumption),
        ];
        for (category, aggregate) in aggregates {
            if let Some(aggregate) = aggregate {
                points.extend(self.line_points(category, aggregate));
            }
        }

        points.extend(data.inverters.values().map(|inv| self.inverter_point(inv)));

        if let Some(batteries) = &data.batteries {
            points.extend(self.battery_points(batteries));
        }
        points
    }

    fn line_points<'s>(
        &'s self,
        category: &'s str,
        aggregate: &'s AggregateElectricalSample,
    ) -> impl Iterator<Item = Point> + 's {
        aggregate
            .lines()
            .iter()
            .enumerate()
            .map(move |(idx, line)| self.line_point(category, idx, line))
    }

    fn line_point(&self, category: &str, idx: usize, line: &PowerSample) -> Point {
        Point::new(format!("{category}-line{idx}"), line.ts)
            .tag(tags::SOURCE, self.source_tag)
            .tag(tags::MEASUREMENT_TYPE, category)
            .tag(tags::LINE_IDX, idx)
            .field("P", line.active_power)
            .field("Q", line.reactive_power)
            .field("S", line.apparent_power)
            .field("I_rms", line.rms_current)
            .field("V_rms", line.rms_voltage)
            .field("whToday", line.wh_today)
            .field("whLifetime", line.wh_lifetime)
    }

    fn inverter_point(&self, inverter: &InverterSample) -> Point {
        let point = Point::new(format!("inverter-production-{}", inverter.serial), inverter.ts)
            .tag(tags::SOURCE, self.source_tag)
            .tag(tags::MEASUREMENT_TYPE, CATEGORY_INVERTER)
            .tag(tags::SERIAL, &inverter.serial)
            .field("P", inverter.watts)
            .field("lastReportDate", inverter.last_report_date as f64);
        self.inverter_tags.apply(point, &inverter.serial)
    }

    fn battery_points<'s>(&'s self, batteries: &'s BatteriesSample) -> impl Iterator<Item = Point> + 's {
        batteries.batteries.iter().map(move |battery| {
            let name = match battery.capacity_wh {
                Some(capacity) => format!("battery-{}-{}", capacity, battery.serial),
                None => format!("battery-{}", battery.serial),
            };
            Point::new(name, batteries.ts)
                .tag(tags::SOURCE, self.source_tag)
                .tag(tags::MEASUREMENT_TYPE, CATEGORY_BATTERY)
                .tag(tags::SERIAL, &battery.serial)
                .field("percentFull", battery.percent_full)
                .field("temperature", battery.temperature)
                .field_opt("maxCellTemp", battery.max_cell_temp)
                .field_opt("led_status", battery.led_status)
        })
    }
}
