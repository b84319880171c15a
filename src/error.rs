//! Error handling module
//!
//! Unified error taxonomy for a refresh run. Every variant except
//! `Validation` is fatal and aborts the run; `Validation` is only raised
//! when the strict pre-swap gate is enabled.

use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum RefreshError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Shadow build failed for view '{0}': {1}")]
    Build(String, String),

    #[error("External fetch failed: {0}")]
    ExternalFetch(String),

    #[error("Promotion swap failed: {0}")]
    Swap(String),

    #[error("Query template error: {0}")]
    Template(String),

    #[error("Validation failed: {0}")]
    Validation(String),
}

impl From<reqwest::Error> for RefreshError {
    fn from(e: reqwest::Error) -> Self {
        RefreshError::ExternalFetch(e.to_string())
    }
}

/// Result type alias used throughout the refresh pipeline
pub type RefreshResult<T> = Result<T, RefreshError>;
