//! Common error types for plsync

use std::path::PathBuf;
use thiserror::Error;

/// Common result type for plsync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types shared by every plsync crate
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration loading or validation error (never retried)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persisted catalog could not be parsed; the file was moved aside
    #[error("Catalog corrupt, quarantined to {quarantined:?}: {reason}")]
    CatalogCorrupt {
        quarantined: Option<PathBuf>,
        reason: String,
    },

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
