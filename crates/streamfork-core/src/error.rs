//! Error types for `streamfork` core library.

use thiserror::Error;

/// Result type alias using `streamfork` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `streamfork` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tracing subscriber setup error
    #[error("Tracing setup error: {0}")]
    Tracing(String),

    /// TOML deserialization error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}
