//! Error types for the tollgate engine.

use thiserror::Error;

/// Main error type for tollgate operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A policy parameter violated its precondition
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration parse or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A distributed backend could not be constructed
    #[error("Backend error: {0}")]
    Backend(String),

    /// The bucket table could not grow to hold another entry
    #[error("Bucket table saturated: failed to allocate {0} buckets")]
    Saturated(usize),

    /// I/O errors (configuration file loading)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for tollgate operations.
pub type Result<T> = std::result::Result<T, Error>;
