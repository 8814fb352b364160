pub mod cache;
pub mod catalog;
pub mod config;
pub mod dialect;
pub mod engine;
pub mod error;
pub mod normalize;
pub mod params;
pub mod query_builder;
pub mod table;
pub mod warehouse;

pub use cache::{CacheKey, CacheStats, ResultCache};
pub use catalog::{QueryTemplate, TemplateCatalog};
pub use config::GmpflowConfig;
pub use engine::AnalyticsEngine;
pub use error::{GmpflowError, Result, WarehouseError};
pub use normalize::{NormalizedView, PivotGrid, PivotSource, ResultShape, ScalarRow, SeriesView};
pub use params::{CanonicalParams, ParamValue, QueryParams, TimeBucket};
pub use query_builder::QueryBuilder;
pub use table::{Column, ResultTable, Value};
#[cfg(feature = "duckdb")]
pub use warehouse::DuckDbWarehouse;
pub use warehouse::WarehouseClient;
