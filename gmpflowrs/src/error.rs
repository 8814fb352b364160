use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GmpflowError>;

#[derive(Debug, Error)]
pub enum GmpflowError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(String),
    #[error("template error: {0}")]
    Template(String),
    #[error("unknown template {0}")]
    UnknownTemplate(String),
    #[error("invalid parameter {field}: {reason}")]
    InvalidParameter { field: String, reason: String },
    #[error("empty result: {0}")]
    EmptyResult(String),
    #[error("result shape error: {0}")]
    Shape(String),
    #[error("warehouse error: {0}")]
    Warehouse(#[from] WarehouseError),
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    /// Failure of a panel fetch, carrying the panel id and canonical parameters.
    #[error("panel {panel} [{params}]: {source}")]
    Panel {
        panel: String,
        params: String,
        #[source]
        source: Box<GmpflowError>,
    },
    /// A failure produced by another caller's query that this caller joined.
    #[error(transparent)]
    Shared(Arc<GmpflowError>),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GmpflowError {
    pub(crate) fn invalid_param(field: impl Into<String>, reason: impl Into<String>) -> Self {
        GmpflowError::InvalidParameter {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// The underlying error with panel context and sharing stripped.
    pub fn root(&self) -> &GmpflowError {
        match self {
            GmpflowError::Panel { source, .. } => source.root(),
            GmpflowError::Shared(inner) => inner.root(),
            other => other,
        }
    }

    /// Caller bugs (bad input, unregistered panel); retrying cannot help.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self.root(),
            GmpflowError::UnknownTemplate(_) | GmpflowError::InvalidParameter { .. }
        )
    }

    /// Failures that may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.root(),
            GmpflowError::Warehouse(_) | GmpflowError::Timeout(_)
        )
    }
}

/// Failures reported by a [`crate::warehouse::WarehouseClient`].
#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("warehouse timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("warehouse overloaded: {0}")]
    Overloaded(String),
    #[cfg(feature = "duckdb")]
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),
}
