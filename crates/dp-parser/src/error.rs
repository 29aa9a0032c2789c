//! Error types for the conversion engine

use thiserror::Error;

/// Result type alias for parser operations
pub type Result<T> = std::result::Result<T, ParserError>;

/// Errors raised while configuring or running a conversion
#[derive(Error, Debug)]
pub enum ParserError {
    /// Unusable configuration: no matching parser pattern, malformed document, bad concurrency
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A strategy parameter is missing or has the wrong type or value
    #[error("Invalid configuration for strategy '{strategy}': field '{field}' {reason}")]
    InvalidConfiguration {
        strategy: String,
        field: String,
        reason: String,
    },

    #[error("Strategy '{name}' is already registered for capability '{capability}'")]
    DuplicateStrategy { capability: String, name: String },

    #[error("No strategy named '{name}' is registered for capability '{capability}'")]
    UnknownStrategy { capability: String, name: String },

    /// The bundle cannot be processed as a whole
    #[error("Bundle error: {0}")]
    Bundle(String),

    /// A single row or line could not be converted and the error policy is `fail`
    #[error("Record error at source row {row}: {reason}")]
    Record { row: u64, reason: String },

    /// A job failed inside the worker pool
    #[error("Worker failed on resource '{resource}': {source}")]
    Worker {
        resource: String,
        #[source]
        source: Box<ParserError>,
    },

    /// Failure reported by the pipeline bus collaborator
    #[error("Pipeline bus error: {0}")]
    Bus(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Common(#[from] dp_common::CommonError),
}

impl ParserError {
    /// Shorthand for [`ParserError::InvalidConfiguration`]
    pub fn invalid(strategy: &str, field: &str, reason: impl Into<String>) -> Self {
        ParserError::InvalidConfiguration {
            strategy: strategy.to_string(),
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether this error, or the job error it wraps, is a configuration problem
    pub fn is_configuration(&self) -> bool {
        match self {
            ParserError::Configuration(_)
            | ParserError::InvalidConfiguration { .. }
            | ParserError::DuplicateStrategy { .. }
            | ParserError::UnknownStrategy { .. } => true,
            ParserError::Worker { source, .. } => source.is_configuration(),
            _ => false,
        }
    }
}
