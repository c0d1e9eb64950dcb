//! Error types for the graph retrieval engine

use thiserror::Error;

/// Result type alias for this library
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during indexing and search
#[derive(Error, Debug)]
pub enum Error {
    /// Missing required key or invalid combination of settings
    #[error("configuration error: {0}")]
    Config(String),

    /// LLM transport or authentication failure
    #[error("provider error: {0}")]
    Provider(String),

    /// Malformed JSON from the LLM after all continuation attempts
    #[error("parse error: {0}")]
    Parse(String),

    /// Archive cannot be opened or a member cannot be read
    #[error("archive error: {0}")]
    Archive(String),

    /// Vector-store write failure
    #[error("index error: {0}")]
    Index(String),

    /// Requested table or index absent when reading
    #[error("not found: {0}")]
    NotFound(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether a reader should treat this error as an empty result.
    ///
    /// Search components never fail on an absent table or index; only
    /// structural errors surface.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
