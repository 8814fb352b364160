//! Configuration system for gmpflow.
//!
//! TOML-based configuration covering query timeouts, the result cache and
//! warehouse backpressure.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GmpflowError, Result};

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GmpflowConfig {
    pub query: QueryConfig,
    pub cache: ResultCacheConfig,
    pub warehouse: WarehouseConfig,
    pub templates: TemplatesConfig,
}

/// Query execution configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Default per-fetch timeout in milliseconds (default: 30000).
    pub timeout_ms: u64,
}

/// Result cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResultCacheConfig {
    /// Maximum cached result tables (default: 256).
    pub max_entries: usize,
    /// Approximate byte budget across cached tables (0 = unbounded).
    pub max_bytes: usize,
    /// Entry lifetime in seconds (0 = never expires).
    pub ttl_secs: u64,
}

/// Warehouse client configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WarehouseConfig {
    /// Maximum concurrent warehouse queries (default: 8).
    pub max_concurrent_queries: usize,
    /// Maximum time (ms) to wait for a free slot before rejecting (0 = wait forever).
    pub queue_timeout_ms: u64,
}

/// Template catalog configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TemplatesConfig {
    /// Load templates from this directory instead of the built-in catalog.
    pub dir: Option<PathBuf>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

impl Default for ResultCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 256,
            max_bytes: 64 * 1024 * 1024,
            ttl_secs: 0,
        }
    }
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            max_concurrent_queries: 8,
            queue_timeout_ms: 1_500,
        }
    }
}

impl QueryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl ResultCacheConfig {
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_secs > 0).then(|| Duration::from_secs(self.ttl_secs))
    }
}

impl GmpflowConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| GmpflowError::Config(format!("failed to read config file: {e}")))?;
        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(toml_str)
            .map_err(|e| GmpflowError::Config(format!("failed to parse config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from default locations (env var, cwd, user config dir, or defaults).
    ///
    /// Search order:
    /// 1. `GMPFLOW_CONFIG` environment variable
    /// 2. `./gmpflow.toml` (current directory)
    /// 3. `~/.config/gmpflow/config.toml` (user config dir)
    /// 4. Built-in defaults
    pub fn load_default() -> Self {
        if let Ok(path) = std::env::var("GMPFLOW_CONFIG") {
            match Self::from_file(&path) {
                Ok(cfg) => {
                    tracing::info!(path = %path, "loaded config from GMPFLOW_CONFIG");
                    return cfg;
                }
                Err(e) => tracing::warn!(path = %path, error = %e, "ignoring GMPFLOW_CONFIG"),
            }
        }

        if let Ok(cfg) = Self::from_file("gmpflow.toml") {
            tracing::info!("loaded config from ./gmpflow.toml");
            return cfg;
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("gmpflow").join("config.toml");
            if let Ok(cfg) = Self::from_file(&user_config) {
                tracing::info!(path = %user_config.display(), "loaded config from user config dir");
                return cfg;
            }
        }

        tracing::debug!("no config file found, using defaults");
        Self::default()
    }

    fn validate(&self) -> Result<()> {
        if self.query.timeout_ms == 0 {
            return Err(GmpflowError::Config(
                "query.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.cache.max_entries == 0 {
            return Err(GmpflowError::Config(
                "cache.max_entries must be greater than zero".to_string(),
            ));
        }
        if self.warehouse.max_concurrent_queries == 0 {
            return Err(GmpflowError::Config(
                "warehouse.max_concurrent_queries must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
