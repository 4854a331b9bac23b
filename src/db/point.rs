//! Store-agnostic data point: a measurement name, a timestamp, string tags and numeric fields.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

pub mod tags {
    pub const SOURCE: &str = "source";
    pub const MEASUREMENT_TYPE: &str = "measurement-type";
    pub const LINE_IDX: &str = "line-idx";
    pub const SERIAL: &str = "serial";
    pub const INTERVAL: &str = "interval";
}

#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub time: DateTime<Utc>,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, f64>,
}

impl Point {
    pub fn new(measurement: impl Into<String>, time: DateTime<Utc>) -> Self {
        Point {
            measurement: measurement.into(),
            time,
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.tags.insert(key.into(), value.to_string());
        self
    }

    pub fn tags<'a>(mut self, extra: impl IntoIterator<Item = (&'a String, &'a String)>) -> Self {
        self.tags
            .extend(extra.into_iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: f64) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn field_opt(self, key: impl Into<String>, value: Option<f64>) -> Self {
        match value {
            Some(v) => self.field(key, v),
            None => self,
        }
    }

    pub fn get_tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn get_field(&self, key: &str) -> Option<f64> {
        self.fields.get(key).copied()
    }
}
