//! Error types for keyflow-gen
//!
//! Usage errors (`NotLoaded`, `AlreadyGenerating`) are programming errors and
//! are returned at the call boundary. Collaborator failures (`Tokenizer`,
//! `Model`, load errors) are fatal for the current run. Nothing is retried.

use thiserror::Error;

/// Main error type for keyflow-gen
#[derive(Error, Debug)]
pub enum Error {
    /// Component used before its configuration/vocabulary/model was loaded
    #[error("Not loaded: {0}")]
    NotLoaded(&'static str),

    /// `start` called while a run is active
    #[error("Already generating")]
    AlreadyGenerating,

    /// Tokenizer lookup or vocabulary file errors
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// Malformed token passed to the vocabulary decoder
    #[error("Decode error: {0}")]
    Decode(String),

    /// Sequence model collaborator failure
    #[error("Model error: {0}")]
    Model(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parse errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors from keyflow-common
    #[error(transparent)]
    Common(#[from] keyflow_common::Error),

    /// Other errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience Result type using keyflow-gen Error
pub type Result<T> = std::result::Result<T, Error>;
