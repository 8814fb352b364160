//! Warehouse client seam.
//!
//! The engine only needs "run this SQL, give me a table". Authentication,
//! pooling and session lifecycle belong to the implementation.

use std::time::Duration;

use async_trait::async_trait;

use crate::dialect::Dialect;
use crate::error::WarehouseError;
use crate::table::ResultTable;

/// Executes rendered SQL against an analytical warehouse.
#[async_trait]
pub trait WarehouseClient: Send + Sync {
    /// Dialect used to render literals for this warehouse.
    fn dialect(&self) -> &(dyn Dialect + Send + Sync);

    /// Execute `sql`, giving up once `timeout` has elapsed.
    ///
    /// The engine also drops the returned future when a caller deadline
    /// passes, so implementations should treat drop as cancellation.
    async fn execute(
        &self,
        sql: &str,
        timeout: Duration,
    ) -> std::result::Result<ResultTable, WarehouseError>;
}

#[cfg(feature = "duckdb")]
mod duckdb;
#[cfg(feature = "duckdb")]
pub use duckdb::DuckDbWarehouse;
