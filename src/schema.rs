//! Handwritten Diesel schema declarations.
//!
//! The tables are not created by this program; `sql/schema.sql` holds the expected DDL.

diesel::table! {
    energy_points (time, destination, measurement, source, field) {
        time -> Timestamptz,
        destination -> Text,
        measurement -> Text,
        source -> Text,
        measurement_type -> Text,
        line_idx -> Nullable<Int4>,
        serial -> Nullable<Text>,
        tags -> Jsonb,
        field -> Text,
        value -> Float8,
    }
}
