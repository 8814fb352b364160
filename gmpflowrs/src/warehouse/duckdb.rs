//! DuckDB warehouse, for local development against an extract of the event table.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use duckdb::types::{TimeUnit, Value as DuckValue};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::config::WarehouseConfig;
use crate::dialect::{Dialect, DuckDbDialect};
use crate::error::WarehouseError;
use crate::table::{ResultTable, Value};

use super::WarehouseClient;

/// Days from 0001-01-01 (CE day 1) to 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// DuckDB connection pool implementing [`WarehouseClient`].
#[derive(Clone)]
pub struct DuckDbWarehouse {
    database_path: PathBuf,
    dialect: DuckDbDialect,
    config: WarehouseConfig,
    limiter: Arc<Semaphore>,
    pool: Arc<Mutex<Vec<duckdb::Connection>>>,
}

impl DuckDbWarehouse {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self::with_config(path, WarehouseConfig::default())
    }

    pub fn with_config<P: AsRef<Path>>(path: P, config: WarehouseConfig) -> Self {
        let path = path.as_ref().to_path_buf();
        tracing::info!(
            path = %path.display(),
            max_concurrency = config.max_concurrent_queries,
            "creating DuckDB warehouse"
        );
        Self {
            database_path: path,
            dialect: DuckDbDialect,
            limiter: Arc::new(Semaphore::new(config.max_concurrent_queries)),
            config,
            pool: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Acquire an execution slot, waiting at most `queue_timeout_ms`.
    async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit, WarehouseError> {
        if self.limiter.available_permits() == 0 {
            tracing::debug!("all DuckDB slots in use, waiting for permit");
        }
        let acquire = self.limiter.clone().acquire_owned();
        let permit = if self.config.queue_timeout_ms == 0 {
            acquire.await
        } else {
            let wait = Duration::from_millis(self.config.queue_timeout_ms);
            match tokio::time::timeout(wait, acquire).await {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::warn!(
                        max_concurrent = self.config.max_concurrent_queries,
                        queue_timeout_ms = self.config.queue_timeout_ms,
                        "DuckDB request rejected: queue timeout exceeded"
                    );
                    return Err(WarehouseError::Overloaded(format!(
                        "queued for {}ms, {} queries already running",
                        self.config.queue_timeout_ms, self.config.max_concurrent_queries
                    )));
                }
            }
        };
        permit.map_err(|e| WarehouseError::Execution(format!("limiter closed: {e}")))
    }

    async fn checkout_connection(&self) -> Result<duckdb::Connection, WarehouseError> {
        let mut guard = self.pool.lock().await;
        if let Some(conn) = guard.pop() {
            let pool_size = guard.len();
            drop(guard);
            tracing::trace!(pool_remaining = pool_size, "reusing pooled DuckDB connection");
            return Ok(conn);
        }
        drop(guard);
        tracing::debug!(path = %self.database_path.display(), "opening new DuckDB connection");
        Ok(duckdb::Connection::open(self.database_path.clone())?)
    }
}

#[async_trait]
impl WarehouseClient for DuckDbWarehouse {
    fn dialect(&self) -> &(dyn Dialect + Send + Sync) {
        &self.dialect
    }

    async fn execute(&self, sql: &str, timeout: Duration) -> Result<ResultTable, WarehouseError> {
        let sql = sql.to_string();
        let _permit = self.acquire_slot().await?;
        let conn = self.checkout_connection().await?;
        let task = tokio::task::spawn_blocking(
            move || -> Result<(ResultTable, duckdb::Connection), WarehouseError> {
                let start = Instant::now();
                let table = run_query(&conn, &sql)?;
                tracing::debug!(
                    rows = table.row_count(),
                    columns = table.columns().len(),
                    ms = start.elapsed().as_millis(),
                    "duckdb execute"
                );
                Ok((table, conn))
            },
        );

        let joined = match tokio::time::timeout(timeout, task).await {
            Ok(joined) => joined,
            Err(_) => {
                // The blocking task finishes on its own; its connection is dropped, not pooled.
                tracing::warn!(timeout_ms = timeout.as_millis(), "duckdb query abandoned");
                return Err(WarehouseError::Timeout(timeout));
            }
        };
        let (table, conn) =
            joined.map_err(|e| WarehouseError::Execution(format!("task join error: {e}")))??;
        self.pool.lock().await.push(conn);
        Ok(table)
    }
}

fn run_query(conn: &duckdb::Connection, sql: &str) -> Result<ResultTable, WarehouseError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows_iter = stmt.query([])?;
    let stmt_ref = rows_iter
        .as_ref()
        .ok_or_else(|| WarehouseError::Execution("statement missing".to_string()))?;
    let mut column_names = Vec::new();
    for idx in 0..stmt_ref.column_count() {
        let name = stmt_ref
            .column_name(idx)
            .map_err(|e| WarehouseError::Execution(e.to_string()))?;
        column_names.push(name.to_string());
    }
    let mut rows = Vec::new();
    while let Some(row) = rows_iter.next()? {
        let mut values = Vec::with_capacity(column_names.len());
        for idx in 0..column_names.len() {
            values.push(duck_value_to_cell(row.get_ref(idx)?.to_owned()));
        }
        rows.push(values);
    }
    ResultTable::from_rows(&column_names, rows)
        .map_err(|e| WarehouseError::Execution(format!("malformed result: {e}")))
}

pub(crate) fn duck_value_to_cell(value: DuckValue) -> Value {
    match value {
        DuckValue::Null => Value::Null,
        DuckValue::Boolean(b) => Value::Number(if b { 1.0 } else { 0.0 }),
        DuckValue::TinyInt(i) => Value::Number(i.into()),
        DuckValue::SmallInt(i) => Value::Number(i.into()),
        DuckValue::Int(i) => Value::Number(i.into()),
        DuckValue::BigInt(i) => Value::Number(i as f64),
        DuckValue::HugeInt(i) => Value::Number(i as f64),
        DuckValue::UTinyInt(i) => Value::Number(i.into()),
        DuckValue::USmallInt(i) => Value::Number(i.into()),
        DuckValue::UInt(i) => Value::Number(i.into()),
        DuckValue::UBigInt(i) => Value::Number(i as f64),
        DuckValue::Float(f) => Value::Number(f.into()),
        DuckValue::Double(f) => Value::Number(f),
        DuckValue::Decimal(d) => d
            .to_string()
            .parse::<f64>()
            .map_or_else(|_| Value::Text(d.to_string()), Value::Number),
        DuckValue::Timestamp(unit, t) => DateTime::from_timestamp_micros(to_micros(unit, t))
            .map_or(Value::Null, |dt| Value::Timestamp(dt.naive_utc())),
        DuckValue::Date32(days) => {
            NaiveDate::from_num_days_from_ce_opt(days.saturating_add(UNIX_EPOCH_DAYS_FROM_CE))
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map_or(Value::Null, Value::Timestamp)
        }
        DuckValue::Text(s) => Value::Text(s),
        DuckValue::Enum(s) => Value::Text(s),
        DuckValue::Blob(bytes) => Value::Text(hex::encode(bytes)),
        other => Value::Text(format!("{other:?}")),
    }
}

fn to_micros(unit: TimeUnit, value: i64) -> i64 {
    match unit {
        TimeUnit::Second => value.saturating_mul(1_000_000),
        TimeUnit::Millisecond => value.saturating_mul(1_000),
        TimeUnit::Microsecond => value,
        TimeUnit::Nanosecond => value / 1_000,
    }
}
