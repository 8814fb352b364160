//! SQL dialect abstractions for the warehouses the engine renders for.
//!
//! Dialects own literal formatting. Templates never format values themselves,
//! so escaping policy lives here and in the query builder only.

use chrono::NaiveDate;

use crate::params::TimeBucket;

pub trait Dialect {
    fn name(&self) -> &'static str;

    /// Quote and escape an arbitrary string as a SQL literal.
    fn render_string(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    fn render_date(&self, date: &NaiveDate) -> String;

    /// Buckets come from a closed enum, so the rendered text is one of a fixed set.
    fn render_bucket(&self, bucket: TimeBucket) -> String {
        format!("'{}'", bucket.as_str())
    }
}

mod duckdb;
mod snowflake;

pub use duckdb::DuckDbDialect;
pub use snowflake::SnowflakeDialect;
