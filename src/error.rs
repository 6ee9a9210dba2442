//! Error types for Tollgate.

use thiserror::Error;

/// Main error type for Tollgate operations.
///
/// Running out of tokens is not an error: `consume` reports it as `Ok(false)`.
/// Every variant here means the limiter itself could not reach a decision.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bucket or store parameters that can never work
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The row lock for a bucket was not granted within the lock timeout
    #[error("Timed out waiting for the lock on bucket '{identifier}'")]
    LockTimeout { identifier: String },

    /// The bucket table has not been created yet
    #[error("Bucket table '{table}' does not exist; call prepare() first")]
    SchemaMissing { table: String },

    /// A bucket record disappeared while it was being bootstrapped
    #[error("Could not create or lock bucket '{identifier}'")]
    BootstrapContention { identifier: String },

    /// Database errors
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
