//! Error types for weft operations.

use thiserror::Error;

/// Result type alias for weft operations.
pub type Result<T> = std::result::Result<T, WeftError>;

/// Main error type for weft operations.
#[derive(Error, Debug)]
pub enum WeftError {
    /// A block, thread, or CAS object does not exist locally.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Signature or AEAD authentication failure.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Serialization failure, disallowed payload, or unknown block type.
    #[error("Malformed block: {0}")]
    Malformed(String),

    /// Key generation, decoding, or validation errors.
    #[error("Key error: {0}")]
    Key(String),

    /// Random number generation errors.
    #[error("Rng error: {0}")]
    Rng(String),

    /// Serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Index or queue persistence errors.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Recoverable delivery or lookup failures; work stays queued for retry.
    #[error("Transient error: {0}")]
    Transient(String),

    /// Configuration errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WeftError {
    /// Creates a new not-found error.
    pub fn not_found<T: ToString>(msg: T) -> Self {
        Self::NotFound(msg.to_string())
    }

    /// Creates a new authentication error.
    pub fn auth<T: ToString>(msg: T) -> Self {
        Self::Auth(msg.to_string())
    }

    /// Creates a new malformed-block error.
    pub fn malformed<T: ToString>(msg: T) -> Self {
        Self::Malformed(msg.to_string())
    }

    /// Creates a new key error.
    pub fn key<T: ToString>(msg: T) -> Self {
        Self::Key(msg.to_string())
    }

    /// Creates a new serialization error.
    pub fn serialization<T: ToString>(msg: T) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Creates a new storage error.
    pub fn storage<T: ToString>(msg: T) -> Self {
        Self::Storage(msg.to_string())
    }

    /// Creates a new transient error.
    pub fn transient<T: ToString>(msg: T) -> Self {
        Self::Transient(msg.to_string())
    }

    /// Creates a new configuration error.
    pub fn config<T: ToString>(msg: T) -> Self {
        Self::Config(msg.to_string())
    }

    /// Returns true if the error indicates a missing object rather than a
    /// failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
