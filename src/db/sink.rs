//! The time-series store as seen by the sampler: a write sink plus an aggregate query sink.

use crate::db::models::AggregateRow;
use crate::db::point::Point;
use chrono::{DateTime, Utc};
use std::fmt::{self, Display, Formatter};

#[derive(Debug)]
pub enum PersistError {
    Connection(String),
    Query(String),
    InvalidDestination(String),
}

impl Display for PersistError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PersistError::Connection(e) => write!(f, "connection error: {}", e),
            PersistError::Query(e) => write!(f, "query error: {}", e),
            PersistError::InvalidDestination(d) => write!(f, "invalid destination: {:?}", d),
        }
    }
}

impl std::error::Error for PersistError {}

impl From<diesel::result::Error> for PersistError {
    fn from(value: diesel::result::Error) -> Self {
        PersistError::Query(value.to_string())
    }
}

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Rollup reductions the sampler asks the store for.
///
/// Every variant yields rows shaped as [`AggregateRow`]; `result` names the reduction.
#[derive(Debug, Clone, Copy)]
pub enum AggregateQuery<'a> {
    /// Time integral of field `P` per series, in watt-hours (`result = "total"`).
    PowerIntegral {
        destination: &'a str,
        source: &'a str,
        window: Window,
    },
    /// Mean, max and min of `percentFull` per battery (`mean_soc`, `max_soc`, `min_soc`).
    BatterySoc {
        destination: &'a str,
        source: &'a str,
        window: Window,
    },
    /// Mean `temperature` per battery (`mean_temperature`).
    BatteryTemperature {
        destination: &'a str,
        source: &'a str,
        window: Window,
    },
    /// `max - min` of a foreign monotonic counter per device and series (`spread`), unscaled.
    CounterSpread {
        source: &'a str,
        series: &'a [String],
        window: Window,
    },
}

impl AggregateQuery<'_> {
    pub fn window(&self) -> Window {
        match self {
            AggregateQuery::PowerIntegral { window, .. }
            | AggregateQuery::BatterySoc { window, .. }
            | AggregateQuery::BatteryTemperature { window, .. }
            | AggregateQuery::CounterSpread { window, .. } => *window,
        }
    }
}

pub trait TimeSeriesSink {
    fn write(&mut self, destination: &str, points: &[Point]) -> Result<(), PersistError>;

    fn query(&mut self, query: &AggregateQuery<'_>) -> Result<Vec<AggregateRow>, PersistError>;
}

impl<T: TimeSeriesSink + ?Sized> TimeSeriesSink for Box<T> {
    fn write(&mut self, destination: &str, points: &[Point]) -> Result<(), PersistError> {
        (**self).write(destination, points)
    }

    fn query(&mut self, query: &AggregateQuery<'_>) -> Result<Vec<AggregateRow>, PersistError> {
        (**self).query(query)
    }
}
