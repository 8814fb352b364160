//! Snowflake dialect implementation.

use chrono::NaiveDate;

use super::Dialect;

#[derive(Debug, Default, Clone, Copy)]
pub struct SnowflakeDialect;

impl Dialect for SnowflakeDialect {
    fn name(&self) -> &'static str {
        "snowflake"
    }

    fn render_string(&self, value: &str) -> String {
        // Backslash is an escape character inside Snowflake string literals
        let escaped = value.replace('\\', "\\\\").replace('\'', "''");
        format!("'{escaped}'")
    }

    fn render_date(&self, date: &NaiveDate) -> String {
        format!("'{}'::DATE", date.format("%Y-%m-%d"))
    }
}
