//! Diesel row structs for the `energy_points` hypertable and rollup query results.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{Float8, Int4, Nullable, Text};
use serde_json::{Map, Value};

use crate::db::point::{Point, tags};
use crate::schema;

// Narrow layout: one row per point field.
#[derive(Debug, Clone, PartialEq, Insertable)]
#[diesel(table_name = schema::energy_points)]
pub struct NewEnergyPoint {
    pub time: DateTime<Utc>,
    pub destination: String,
    pub measurement: String,
    pub source: String,
    pub measurement_type: String,
    pub line_idx: Option<i32>,
    pub serial: Option<String>,
    pub tags: Value,
    pub field: String,
    pub value: f64,
}

impl NewEnergyPoint {
    /// Splits a point into rows. Well-known tags get columns, the rest lands in `tags`.
    pub fn from_point(destination: &str, point: &Point) -> Vec<Self> {
        let source = point.get_tag(tags::SOURCE).unwrap_or_default().to_string();
        let measurement_type = point.get_tag(tags::MEASUREMENT_TYPE).unwrap_or_default().to_string();
        let line_idx = point.get_tag(tags::LINE_IDX).and_then(|s| s.parse::<i32>().ok());
        let serial = point.get_tag(tags::SERIAL).map(str::to_string);
        let extra = point
            .tags
            .iter()
            .filter(|(k, _)| ![tags::SOURCE, tags::MEASUREMENT_TYPE, tags::LINE_IDX, tags::SERIAL].contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect::<Map<_, _>>();
        let extra = Value::Object(extra);

        point
            .fields
            .iter()
            .map(|(field, value)| NewEnergyPoint {
                time: point.time,
                destination: destination.to_string(),
                measurement: point.measurement.clone(),
                source: source.clone(),
                measurement_type: measurement_type.clone(),
                line_idx,
                serial: serial.clone(),
                tags: extra.clone(),
                field: field.clone(),
                value: *value,
            })
            .collect()
    }
}

/// One row of any rollup query; see `AggregateQuery` for what `result` holds per query.
#[derive(Debug, Clone, PartialEq, QueryableByName)]
pub struct AggregateRow {
    #[diesel(sql_type = Text)]
    pub measurement_type: String,
    #[diesel(sql_type = Nullable<Int4>)]
    pub line_idx: Option<i32>,
    #[diesel(sql_type = Nullable<Text>)]
    pub serial: Option<String>,
    #[diesel(sql_type = Text)]
    pub result: String,
    #[diesel(sql_type = Float8)]
    pub value: f64,
}
