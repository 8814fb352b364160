use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use gmpflow::{AnalyticsEngine, DuckDbWarehouse, GmpflowConfig, NormalizedView, QueryParams, TimeBucket};
use tracing_subscriber::EnvFilter;

fn bootstrap_duckdb(path: &std::path::Path) -> anyhow::Result<()> {
    let conn = duckdb::Connection::open(path)?;
    conn.execute_batch(
        "
        CREATE TABLE gmp_events (
            created_at TIMESTAMP,
            id VARCHAR,
            source_chain VARCHAR,
            destination_chain VARCHAR,
            user_address VARCHAR,
            amount_usd DOUBLE,
            fee DOUBLE
        );
        INSERT INTO gmp_events VALUES
            ('2023-01-02 10:15:00', 'tx1', 'ethereum', 'osmosis', '0xa1', 1200.0, 3.1),
            ('2023-01-03 14:02:00', 'tx2', 'ethereum', 'osmosis', '0xb2', 450.0, 2.4),
            ('2023-01-05 14:40:00', 'tx3', 'polygon', 'ethereum', '0xa1', 80.0, 0.6),
            ('2023-01-11 09:30:00', 'tx4', 'avalanche', 'moonbeam', '0xc3', 2500.0, 4.0),
            ('2023-01-12 22:05:00', 'tx5', 'ethereum', 'arbitrum', '0xd4', 310.0, 5.2),
            ('2023-01-19 14:55:00', 'tx6', 'osmosis', 'ethereum', '0xb2', 60.0, 0.3);
        ",
    )?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let db_path = std::env::temp_dir().join("gmpflow_demo.duckdb");
    if db_path.exists() {
        std::fs::remove_file(&db_path)?;
    }
    bootstrap_duckdb(&db_path)?;

    let mut config = GmpflowConfig::load_default();
    config.templates.dir = Some(PathBuf::from(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/demos/templates"
    )));
    let warehouse = Arc::new(DuckDbWarehouse::with_config(&db_path, config.warehouse.clone()));
    let engine = AnalyticsEngine::from_config(warehouse, &config)?;

    let params = QueryParams::range(
        NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
        NaiveDate::from_ymd_opt(2023, 1, 31).unwrap(),
        TimeBucket::Week,
    );
    let panels = ["overview_kpi", "time_series", "activity_heatmap"];
    let results = engine.fetch_panels(&panels, &params).await;

    for (panel, result) in panels.iter().zip(results) {
        println!("== {panel}");
        match result {
            Ok(NormalizedView::Pivot(source)) => {
                let grid = source.pivot("day_of_week", "hour_of_day", "txns")?;
                println!("hours: {:?}", grid.col_keys());
                for (day, row) in grid.row_keys().iter().zip(grid.to_dense()) {
                    println!("{day:>10} {row:?}");
                }
            }
            Ok(view) => println!("{}", serde_json::to_string_pretty(&view)?),
            Err(err) if err.is_caller_error() => return Err(err.into()),
            Err(err) => println!("no data: {err}"),
        }
    }

    // Same parameters again: answered from the cache.
    engine.fetch("overview_kpi", &params).await?;
    println!("cache: {:?}", engine.cache().stats());
    Ok(())
}
