//! Panel fetch orchestration: template lookup, parameter validation, cached
//! warehouse execution and normalization.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;

use crate::cache::{CacheKey, ResultCache};
use crate::catalog::TemplateCatalog;
use crate::config::GmpflowConfig;
use crate::error::{GmpflowError, Result};
use crate::normalize::{normalize, NormalizedView};
use crate::params::QueryParams;
use crate::query_builder::QueryBuilder;
use crate::warehouse::WarehouseClient;

/// Entry point for the presentation layer.
pub struct AnalyticsEngine {
    catalog: Arc<TemplateCatalog>,
    client: Arc<dyn WarehouseClient>,
    cache: ResultCache,
    builder: QueryBuilder,
    default_timeout: Duration,
}

impl AnalyticsEngine {
    pub fn new(
        catalog: Arc<TemplateCatalog>,
        client: Arc<dyn WarehouseClient>,
        config: &GmpflowConfig,
    ) -> Self {
        Self {
            catalog,
            client,
            cache: ResultCache::with_config(&config.cache),
            builder: QueryBuilder::new(),
            default_timeout: config.query.timeout(),
        }
    }

    /// Built-in panels with default limits.
    pub fn with_defaults(client: Arc<dyn WarehouseClient>) -> Result<Self> {
        Ok(Self::new(
            TemplateCatalog::builtin()?,
            client,
            &GmpflowConfig::default(),
        ))
    }

    /// Use `templates.dir` from the config when set, the built-in panels otherwise.
    pub fn from_config(client: Arc<dyn WarehouseClient>, config: &GmpflowConfig) -> Result<Self> {
        let catalog = match &config.templates.dir {
            Some(dir) => {
                tracing::info!(dir = %dir.display(), "loading panel templates");
                Arc::new(TemplateCatalog::load_from_dir(dir)?)
            }
            None => TemplateCatalog::builtin()?,
        };
        Ok(Self::new(catalog, client, config))
    }

    pub fn catalog(&self) -> &TemplateCatalog {
        &self.catalog
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub async fn fetch(&self, panel: &str, params: &QueryParams) -> Result<NormalizedView> {
        self.fetch_with_timeout(panel, params, self.default_timeout)
            .await
    }

    /// Fetch one panel, failing with `Timeout` once `timeout` elapses.
    ///
    /// On timeout the in-flight warehouse call is dropped and the cache key
    /// stays empty.
    pub async fn fetch_with_timeout(
        &self,
        panel: &str,
        params: &QueryParams,
        timeout: Duration,
    ) -> Result<NormalizedView> {
        let template = self
            .catalog
            .get(panel)
            .map_err(|e| panel_error(panel, describe(params), e))?;
        let canonical = self
            .builder
            .canonicalize(template, params)
            .map_err(|e| panel_error(panel, describe(params), e))?;
        let key = CacheKey::new(panel, canonical.clone());

        let client = &self.client;
        let builder = &self.builder;
        let canonical_ref = &canonical;
        let started = Instant::now();
        let fetched = tokio::time::timeout(
            timeout,
            self.cache.get_or_compute(&key, || async move {
                let sql = builder.render(template, canonical_ref, client.dialect())?;
                let table = client.execute(&sql, timeout).await?;
                tracing::debug!(
                    panel,
                    rows = table.row_count(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "warehouse query finished"
                );
                Ok(table)
            }),
        )
        .await
        .unwrap_or(Err(GmpflowError::Timeout(timeout)));

        let table = match fetched {
            Ok(table) => table,
            Err(err) => {
                tracing::warn!(panel, params = %canonical, error = %err, "panel fetch failed");
                return Err(panel_error(panel, canonical.to_string(), err));
            }
        };

        normalize(&table, template.shape()).map_err(|e| panel_error(panel, canonical.to_string(), e))
    }

    /// Fetch several panels concurrently; results come back in input order.
    pub async fn fetch_panels(
        &self,
        panels: &[&str],
        params: &QueryParams,
    ) -> Vec<Result<NormalizedView>> {
        join_all(panels.iter().map(|panel| self.fetch(panel, params))).await
    }

    /// Drop the cached result for one panel/params pair so the next fetch re-queries.
    pub fn invalidate(&self, panel: &str, params: &QueryParams) -> Result<()> {
        let template = self
            .catalog
            .get(panel)
            .map_err(|e| panel_error(panel, describe(params), e))?;
        let canonical = self
            .builder
            .canonicalize(template, params)
            .map_err(|e| panel_error(panel, describe(params), e))?;
        self.cache.invalidate(&CacheKey::new(panel, canonical));
        Ok(())
    }
}

fn panel_error(panel: &str, params: String, source: GmpflowError) -> GmpflowError {
    GmpflowError::Panel {
        panel: panel.to_string(),
        params,
        source: Box::new(source),
    }
}

fn describe(params: &QueryParams) -> String {
    params
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join(", ")
}
