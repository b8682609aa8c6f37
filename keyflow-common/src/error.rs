//! Common error types for keyflow

use thiserror::Error;

/// Common result type for keyflow operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types shared by the keyflow crates
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parse error (vocabulary, tokenizer and model files)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parse error (bootstrap config file)
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid caller input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
