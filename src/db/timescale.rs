//! `TimeSeriesSink` backed by TimescaleDB through a blocking diesel connection.

use crate::db::models::{AggregateRow, NewEnergyPoint};
use crate::db::point::Point;
use crate::db::sink::{AggregateQuery, PersistError, TimeSeriesSink};
use crate::schema;
use diesel::PgConnection;
use diesel::prelude::*;
use diesel::sql_types::{Array, Text, Timestamptz};
use log::{debug, trace};

// Postgres caps bind parameters at 65535 per statement; each row binds 10.
const INSERT_CHUNK_ROWS: usize = 5000;

// Trapezoidal integral of `P` over each series, converted from watt-seconds to watt-hours.
// A series with a single sample in the window has no interval to integrate and is absent.
const POWER_INTEGRAL_SQL: &str = r#"
SELECT measurement_type, line_idx, serial, 'total' AS result,
       SUM((value + prev_value) / 2.0 * EXTRACT(EPOCH FROM (time - prev_time))::float8) / 3600.0 AS value
FROM (
    SELECT measurement, measurement_type, line_idx, serial, time, value,
           LAG(value) OVER w AS prev_value,
           LAG(time) OVER w AS prev_time
    FROM energy_points
    WHERE destination = $1 AND source = $2 AND field = 'P' AND time >= $3 AND time < $4
    WINDOW w AS (PARTITION BY measurement ORDER BY time)
) AS paired
WHERE prev_time IS NOT NULL
GROUP BY measurement, measurement_type, line_idx, serial
"#;

const BATTERY_SOC_SQL: &str = r#"
SELECT s.measurement_type, s.line_idx, s.serial, v.result, v.value
FROM (
    SELECT measurement_type, line_idx, serial,
           AVG(value) AS mean_soc, MAX(value) AS max_soc, MIN(value) AS min_soc
    FROM energy_points
    WHERE destination = $1 AND source = $2 AND measurement_type = 'battery' AND field = 'percentFull'
      AND time >= $3 AND time < $4
    GROUP BY measurement_type, line_idx, serial
) AS s
CROSS JOIN LATERAL (
    VALUES ('mean_soc', s.mean_soc), ('max_soc', s.max_soc), ('min_soc', s.min_soc)
) AS v(result, value)
"#;

const BATTERY_TEMPERATURE_SQL: &str = r#"
SELECT measurement_type, line_idx, serial, 'mean_temperature' AS result, AVG(value) AS value
FROM energy_points
WHERE destination = $1 AND source = $2 AND measurement_type = 'battery' AND field = 'temperature'
  AND time >= $3 AND time < $4
GROUP BY measurement_type, line_idx, serial
"#;

const COUNTER_SPREAD_SQL: &str = r#"
SELECT series AS measurement_type, NULL::int4 AS line_idx, device AS serial, 'spread' AS result,
       MAX(value) - MIN(value) AS value
FROM counter_readings
WHERE source = $1 AND series = ANY($2) AND time >= $3 AND time < $4
GROUP BY series, device
"#;

pub struct TimescaleSink {
    conn: PgConnection,
}

impl TimescaleSink {
    pub fn connect(database_url: &str) -> Result<Self, PersistError> {
        let conn = PgConnection::establish(database_url).map_err(|e| PersistError::Connection(e.to_string()))?;
        Ok(TimescaleSink { conn })
    }
}

impl TimeSeriesSink for TimescaleSink {
    fn write(&mut self, destination: &str, points: &[Point]) -> Result<(), PersistError> {
        if destination.trim().is_empty() {
            return Err(PersistError::InvalidDestination(destination.to_string()));
        }
        let rows = points
            .iter()
            .flat_map(|p| NewEnergyPoint::from_point(destination, p))
            .collect::<Vec<_>>();
        if rows.is_empty() {
            return Ok(());
        }

        use schema::energy_points::dsl as E;

        let inserted = self.conn.transaction::<usize, diesel::result::Error, _>(|conn| {
            let mut total = 0;
            for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
                total += diesel::insert_into(E::energy_points)
                    .values(chunk)
                    .on_conflict_do_nothing()
                    .execute(conn)?;
            }
            Ok(total)
        })?;
        debug!(
            "Wrote {} point(s) as {} row(s) to {} ({} new)",
            points.len(),
            rows.len(),
            destination,
            inserted
        );
        Ok(())
    }

    fn query(&mut self, query: &AggregateQuery<'_>) -> Result<Vec<AggregateRow>, PersistError> {
        let window = query.window();
        trace!("Aggregate query {:?} over [{}, {})", query, window.start, window.end);
        let rows = match *query {
            AggregateQuery::PowerIntegral {
                destination,
                source,
                window,
            } => diesel::sql_query(POWER_INTEGRAL_SQL)
                .bind::<Text, _>(destination)
                .bind::<Text, _>(source)
                .bind::<Timestamptz, _>(window.start)
                .bind::<Timestamptz, _>(window.end)
                .load::<AggregateRow>(&mut self.conn)?,
            AggregateQuery::BatterySoc {
                destination,
                source,
                window,
            } => diesel::sql_query(BATTERY_SOC_SQL)
                .bind::<Text, _>(destination)
                .bind::<Text, _>(source)
                .bind::<Timestamptz, _>(window.start)
                .bind::<Timestamptz, _>(window.end)
                .load::<AggregateRow>(&mut self.conn)?,
            AggregateQuery::BatteryTemperature {
                destination,
                source,
                window,
            } => diesel::sql_query(BATTERY_TEMPERATURE_SQL)
                .bind::<Text, _>(destination)
                .bind::<Text, _>(source)
                .bind::<Timestamptz, _>(window.start)
                .bind::<Timestamptz, _>(window.end)
                .load::<AggregateRow>(&mut self.conn)?,
            AggregateQuery::CounterSpread { source, series, window } => diesel::sql_query(COUNTER_SPREAD_SQL)
                .bind::<Text, _>(source)
                .bind::<Array<Text>, _>(series)
                .bind::<Timestamptz, _>(window.start)
                .bind::<Timestamptz, _>(window.end)
                .load::<AggregateRow>(&mut self.conn)?,
        };
        Ok(rows)
    }
}
