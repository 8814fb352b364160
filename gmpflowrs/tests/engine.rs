//! Integration tests for AnalyticsEngine against a stub warehouse.
//!
//! The stub counts executions so cache behaviour (hits, single-flight,
//! failures and timeouts not being cached) can be asserted directly.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use gmpflow::dialect::{Dialect, SnowflakeDialect};
use gmpflow::{
    AnalyticsEngine, GmpflowConfig, GmpflowError, QueryParams, ResultTable, TemplateCatalog,
    TimeBucket, Value, WarehouseClient, WarehouseError,
};

// ============================================================================
// Test fixtures
// ============================================================================

type Responder = dyn Fn(usize, &str) -> Result<ResultTable, WarehouseError> + Send + Sync;

/// Warehouse double: records every SQL string and answers through `respond`.
struct StubWarehouse {
    calls: AtomicUsize,
    delay: Duration,
    sql_log: Mutex<Vec<String>>,
    respond: Box<Responder>,
}

impl StubWarehouse {
    fn new(
        respond: impl Fn(usize, &str) -> Result<ResultTable, WarehouseError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            sql_log: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_sql(&self) -> Option<String> {
        self.sql_log.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl WarehouseClient for StubWarehouse {
    fn dialect(&self) -> &(dyn Dialect + Send + Sync) {
        &SnowflakeDialect
    }

    async fn execute(&self, sql: &str, _timeout: Duration) -> Result<ResultTable, WarehouseError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.sql_log.lock().unwrap().push(sql.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.respond)(call, sql)
    }
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn params() -> QueryParams {
    QueryParams::range(date(2023, 1, 1), date(2023, 3, 31), TimeBucket::Week)
}

/// Snowflake upper-cases unquoted aliases; the engine must not care.
fn kpi_table() -> ResultTable {
    ResultTable::from_rows(
        &["TOTAL_TXNS", "UNIQUE_USERS", "TOTAL_VOLUME", "AVG_VOLUME_PER_USER"],
        vec![vec![
            Value::from(120_i64),
            Value::from(40_i64),
            Value::from(98_000.0_f64),
            Value::from(2_450.0_f64),
        ]],
    )
    .unwrap()
}

fn series_table() -> ResultTable {
    let weeks = [date(2023, 1, 2), date(2023, 1, 9), date(2023, 1, 16)];
    ResultTable::from_rows(
        &["bucket_start", "txns", "users", "volume"],
        weeks
            .iter()
            .enumerate()
            .map(|(i, d)| {
                vec![
                    Value::from(d.and_hms_opt(0, 0, 0).unwrap()),
                    Value::from(10 * (i as i64 + 1)),
                    Value::from(3_i64),
                    Value::from(1_000.0 * (i as f64 + 1.0)),
                ]
            })
            .collect(),
    )
    .unwrap()
}

fn routes_table() -> ResultTable {
    ResultTable::from_rows(
        &["source_chain", "destination_chain", "txns", "volume", "users"],
        vec![
            vec!["ethereum".into(), "osmosis".into(), 5_i64.into(), 500.0_f64.into(), 2_i64.into()],
            vec!["polygon".into(), "ethereum".into(), 3_i64.into(), 90.0_f64.into(), 1_i64.into()],
        ],
    )
    .unwrap()
}

fn answer_by_panel(_call: usize, sql: &str) -> Result<ResultTable, WarehouseError> {
    if sql.contains("total_txns") {
        Ok(kpi_table())
    } else if sql.contains("ORDER BY txns DESC") {
        Ok(routes_table())
    } else {
        Ok(series_table())
    }
}

fn engine_with(stub: Arc<StubWarehouse>) -> AnalyticsEngine {
    AnalyticsEngine::new(
        TemplateCatalog::builtin().unwrap(),
        stub,
        &GmpflowConfig::default(),
    )
}

// ============================================================================
// Fetch and normalization
// ============================================================================

#[tokio::test]
async fn overview_kpi_returns_one_scalar_row() -> anyhow::Result<()> {
    let stub = Arc::new(StubWarehouse::new(|_, _| Ok(kpi_table())));
    let engine = engine_with(stub.clone());

    let view = engine.fetch("overview_kpi", &params()).await?;
    let row = view.as_scalar().expect("scalar view");
    assert_eq!(row.number("total_txns"), Some(120.0));
    assert_eq!(row.number("unique_users"), Some(40.0));
    assert_eq!(row.len(), 4);
    Ok(())
}

#[tokio::test]
async fn rendered_sql_uses_dialect_literals() -> anyhow::Result<()> {
    let stub = Arc::new(StubWarehouse::new(answer_by_panel));
    let engine = engine_with(stub.clone());

    engine.fetch("time_series", &params()).await?;
    let sql = stub.last_sql().unwrap();
    assert!(sql.contains("'2023-01-01'::DATE"), "{sql}");
    assert!(sql.contains("'2023-03-31'::DATE"), "{sql}");
    assert!(sql.contains("DATE_TRUNC('week'"), "{sql}");
    assert!(!sql.contains("{{"), "{sql}");
    Ok(())
}

#[tokio::test]
async fn series_keeps_warehouse_order() -> anyhow::Result<()> {
    let stub = Arc::new(StubWarehouse::new(|_, _| Ok(series_table())));
    let engine = engine_with(stub);

    let view = engine.fetch("time_series", &params()).await?;
    let series = view.as_series().expect("series view");
    let days: Vec<_> = series.times().iter().map(|t| t.date()).collect();
    assert_eq!(days, vec![date(2023, 1, 2), date(2023, 1, 9), date(2023, 1, 16)]);
    assert_eq!(
        series.numbers("txns").unwrap(),
        vec![Some(10.0), Some(20.0), Some(30.0)]
    );
    Ok(())
}

#[tokio::test]
async fn fetch_panels_returns_results_in_request_order() -> anyhow::Result<()> {
    let stub = Arc::new(StubWarehouse::new(answer_by_panel));
    let engine = engine_with(stub.clone());

    let results = engine
        .fetch_panels(&["overview_kpi", "chain_routes", "missing"], &params())
        .await;
    assert_eq!(results.len(), 3);
    assert!(results[0].as_ref().unwrap().as_scalar().is_some());

    let routes = results[1].as_ref().unwrap().as_pivot().expect("pivot view");
    let grid = routes.pivot("source_chain", "destination_chain", "txns")?;
    assert_eq!(grid.get("ethereum", "osmosis"), Some(5.0));
    assert_eq!(grid.get("polygon", "osmosis"), Some(0.0));
    assert_eq!(grid.get("arbitrum", "osmosis"), None);

    let err = results[2].as_ref().unwrap_err();
    assert!(matches!(err.root(), GmpflowError::UnknownTemplate(id) if id == "missing"));
    assert_eq!(stub.calls(), 2);
    Ok(())
}

// ============================================================================
// Caching
// ============================================================================

#[tokio::test]
async fn identical_fetch_hits_cache() -> anyhow::Result<()> {
    let stub = Arc::new(StubWarehouse::new(|_, _| Ok(kpi_table())));
    let engine = engine_with(stub.clone());

    engine.fetch("overview_kpi", &params()).await?;
    engine.fetch("overview_kpi", &params()).await?;
    assert_eq!(stub.calls(), 1);

    // same values spelled differently canonicalize to the same key
    let spelled = QueryParams::new()
        .with("start_date", "2023-01-01")
        .with("end_date", "2023-03-31")
        .with("bucket", " WEEK ");
    engine.fetch("overview_kpi", &spelled).await?;
    assert_eq!(stub.calls(), 1);

    let monthly = QueryParams::range(date(2023, 1, 1), date(2023, 3, 31), TimeBucket::Month);
    engine.fetch("overview_kpi", &monthly).await?;
    assert_eq!(stub.calls(), 2);

    let stats = engine.cache().stats();
    assert_eq!(stats.misses, 2);
    assert_eq!(stats.hits, 2);
    Ok(())
}

#[tokio::test]
async fn concurrent_identical_fetches_share_one_query() -> anyhow::Result<()> {
    let stub = Arc::new(
        StubWarehouse::new(|_, _| Ok(kpi_table())).with_delay(Duration::from_millis(100)),
    );
    let engine = Arc::new(engine_with(stub.clone()));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.fetch("overview_kpi", &params()).await })
        })
        .collect();
    for handle in handles {
        let view = handle.await??;
        assert_eq!(view.as_scalar().unwrap().number("total_txns"), Some(120.0));
    }
    assert_eq!(stub.calls(), 1);
    Ok(())
}

#[tokio::test]
async fn unrelated_panels_do_not_queue_behind_each_other() -> anyhow::Result<()> {
    let stub = Arc::new(
        StubWarehouse::new(answer_by_panel).with_delay(Duration::from_millis(150)),
    );
    let engine = engine_with(stub.clone());

    let started = std::time::Instant::now();
    let results = engine
        .fetch_panels(&["overview_kpi", "time_series", "chain_routes"], &params())
        .await;
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(stub.calls(), 3);
    assert!(started.elapsed() < Duration::from_millis(400));
    Ok(())
}

#[tokio::test]
async fn warehouse_failure_is_not_cached() -> anyhow::Result<()> {
    let stub = Arc::new(StubWarehouse::new(|call, _| {
        if call == 0 {
            Err(WarehouseError::Execution("warehouse unavailable".to_string()))
        } else {
            Ok(kpi_table())
        }
    }));
    let engine = engine_with(stub.clone());

    let err = engine.fetch("overview_kpi", &params()).await.unwrap_err();
    assert!(matches!(err.root(), GmpflowError::Warehouse(WarehouseError::Execution(_))));
    assert!(err.is_transient());
    assert!(engine.cache().is_empty());

    engine.fetch("overview_kpi", &params()).await?;
    assert_eq!(stub.calls(), 2);
    Ok(())
}

#[tokio::test]
async fn timeout_abandons_query_without_poisoning_cache() -> anyhow::Result<()> {
    let stub = Arc::new(
        StubWarehouse::new(|_, _| Ok(kpi_table())).with_delay(Duration::from_millis(200)),
    );
    let engine = engine_with(stub.clone());

    let err = engine
        .fetch_with_timeout("overview_kpi", &params(), Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(matches!(err.root(), GmpflowError::Timeout(t) if *t == Duration::from_millis(20)));
    assert!(err.is_transient());
    assert!(engine.cache().is_empty());

    engine
        .fetch_with_timeout("overview_kpi", &params(), Duration::from_secs(5))
        .await?;
    assert_eq!(stub.calls(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn waiters_take_over_when_the_first_caller_gives_up() -> anyhow::Result<()> {
    let stub = Arc::new(
        StubWarehouse::new(|_, _| Ok(kpi_table())).with_delay(Duration::from_millis(300)),
    );
    let engine = Arc::new(engine_with(stub.clone()));

    let impatient = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .fetch_with_timeout("overview_kpi", &params(), Duration::from_millis(30))
                .await
        })
    };
    let patient = |after: u64| {
        let engine = engine.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(after)).await;
            engine
                .fetch_with_timeout("overview_kpi", &params(), Duration::from_secs(5))
                .await
        })
    };
    let early = patient(5);
    let late = patient(85);

    let err = impatient.await?.unwrap_err();
    assert!(matches!(err.root(), GmpflowError::Timeout(_)));
    for handle in [early, late] {
        let view = handle.await??;
        assert_eq!(view.as_scalar().unwrap().number("total_txns"), Some(120.0));
    }
    assert_eq!(stub.calls(), 2);
    assert_eq!(engine.cache().in_flight(), 0);
    Ok(())
}

#[tokio::test]
async fn concurrent_callers_share_one_failure() -> anyhow::Result<()> {
    let stub = Arc::new(
        StubWarehouse::new(|call, _| {
            if call == 0 {
                Err(WarehouseError::Execution("warehouse unavailable".to_string()))
            } else {
                Ok(kpi_table())
            }
        })
        .with_delay(Duration::from_millis(50)),
    );
    let engine = Arc::new(engine_with(stub.clone()));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.fetch("overview_kpi", &params()).await })
        })
        .collect();
    for handle in handles {
        let err = handle.await?.unwrap_err();
        assert!(matches!(err.root(), GmpflowError::Warehouse(WarehouseError::Execution(_))));
        assert!(err.is_transient());
        assert!(err.to_string().contains("overview_kpi"), "{err}");
    }
    assert_eq!(stub.calls(), 1);
    assert!(engine.cache().is_empty());

    engine.fetch("overview_kpi", &params()).await?;
    assert_eq!(stub.calls(), 2);
    Ok(())
}

#[tokio::test]
async fn invalidate_forces_a_new_query() -> anyhow::Result<()> {
    let stub = Arc::new(StubWarehouse::new(|_, _| Ok(kpi_table())));
    let engine = engine_with(stub.clone());

    engine.fetch("overview_kpi", &params()).await?;
    engine.invalidate("overview_kpi", &params())?;
    engine.fetch("overview_kpi", &params()).await?;
    assert_eq!(stub.calls(), 2);
    Ok(())
}

// ============================================================================
// Errors
// ============================================================================

#[tokio::test]
async fn invalid_parameters_never_reach_the_warehouse() {
    let stub = Arc::new(StubWarehouse::new(|_, _| Ok(kpi_table())));
    let engine = engine_with(stub.clone());

    let bad_bucket = params().with("bucket", "year");
    let err = engine.fetch("overview_kpi", &bad_bucket).await.unwrap_err();
    assert!(err.is_caller_error());
    assert!(matches!(
        err.root(),
        GmpflowError::InvalidParameter { field, .. } if field == "bucket"
    ));

    let reversed = QueryParams::range(date(2023, 3, 31), date(2023, 1, 1), TimeBucket::Day);
    let err = engine.fetch("overview_kpi", &reversed).await.unwrap_err();
    assert!(matches!(
        err.root(),
        GmpflowError::InvalidParameter { field, .. } if field == "end_date"
    ));

    let missing = QueryParams::new().with("start_date", date(2023, 1, 1));
    assert!(engine.fetch("overview_kpi", &missing).await.unwrap_err().is_caller_error());

    let extra = params().with("chain", "ethereum");
    assert!(engine.fetch("overview_kpi", &extra).await.unwrap_err().is_caller_error());

    assert_eq!(stub.calls(), 0);
}

#[tokio::test]
async fn unknown_panel_is_a_caller_error() {
    let stub = Arc::new(StubWarehouse::new(|_, _| Ok(kpi_table())));
    let engine = engine_with(stub.clone());

    let err = engine.fetch("revenue", &params()).await.unwrap_err();
    assert!(err.is_caller_error());
    assert!(matches!(err.root(), GmpflowError::UnknownTemplate(id) if id == "revenue"));
    assert_eq!(stub.calls(), 0);
}

#[tokio::test]
async fn empty_scalar_result_is_distinct_from_zero() {
    let stub = Arc::new(StubWarehouse::new(|_, _| {
        Ok(ResultTable::from_rows(&["total_txns", "unique_users"], vec![]).unwrap())
    }));
    let engine = engine_with(stub);

    let err = engine.fetch("overview_kpi", &params()).await.unwrap_err();
    assert!(matches!(err.root(), GmpflowError::EmptyResult(_)));
    assert!(!err.is_caller_error());
    assert!(!err.is_transient());
}

#[tokio::test]
async fn errors_carry_panel_and_parameters() {
    let stub = Arc::new(StubWarehouse::new(|_, _| {
        Err(WarehouseError::Overloaded("queue full".to_string()))
    }));
    let engine = engine_with(stub);

    let err = engine.fetch("time_series", &params()).await.unwrap_err();
    match &err {
        GmpflowError::Panel { panel, params, .. } => {
            assert_eq!(panel, "time_series");
            assert_eq!(
                params,
                "bucket=week, end_date=2023-03-31, start_date=2023-01-01"
            );
        }
        other => panic!("expected panel context, got {other:?}"),
    }
    let message = err.to_string();
    assert!(message.contains("time_series"), "{message}");
    assert!(message.contains("queue full"), "{message}");
}
