//! Error types for query resolution

use thiserror::Error;

use crate::models::DataSource;

/// Result type for query operations
pub type Result<T> = std::result::Result<T, QueryError>;

/// Query resolution errors
#[derive(Error, Debug, Clone)]
pub enum QueryError {
    #[error("Search failed: {message}")]
    SearchFailed {
        message: String,
        failed_attempts: Vec<DataSource>,
    },

    #[error("No strategy found for discovering type {type_name}")]
    UnresolvedTypeInQuery {
        type_name: String,
        failed_attempts: Vec<DataSource>,
    },

    #[error("Query {query_id} was cancelled")]
    QueryCancelled { query_id: String },

    #[error("Type not found: {name}{}", suggestion_hint(.suggestion))]
    TypeNotFound {
        name: String,
        suggestion: Option<String>,
    },

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Operation not found: {service}.{operation}")]
    OperationNotFound { service: String, operation: String },

    #[error("Unable to resolve parameters for {operation}: {message}")]
    UnresolvedOperationParameters { operation: String, message: String },

    #[error("Invocation of {operation} failed: {message}")]
    Invocation {
        operation: String,
        message: String,
        status: Option<u16>,
    },

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

fn suggestion_hint(suggestion: &Option<String>) -> String {
    suggestion
        .as_ref()
        .map(|s| format!(" (did you mean {}?)", s))
        .unwrap_or_default()
}

impl QueryError {
    /// Failed attempts carried by search failures, empty for everything else
    pub fn failed_attempts(&self) -> &[DataSource] {
        match self {
            QueryError::SearchFailed { failed_attempts, .. }
            | QueryError::UnresolvedTypeInQuery { failed_attempts, .. } => failed_attempts,
            _ => &[],
        }
    }

    /// True for failures that mean "nothing found" rather than a hard fault
    pub fn is_search_failure(&self) -> bool {
        matches!(
            self,
            QueryError::SearchFailed { .. } | QueryError::UnresolvedTypeInQuery { .. }
        )
    }
}

impl From<std::io::Error> for QueryError {
    fn from(err: std::io::Error) -> Self {
        QueryError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for QueryError {
    fn from(err: serde_json::Error) -> Self {
        QueryError::Json(err.to_string())
    }
}

impl From<config_crate::ConfigError> for QueryError {
    fn from(err: config_crate::ConfigError) -> Self {
        QueryError::Config(err.to_string())
    }
}
