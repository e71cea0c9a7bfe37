//! Error types for the Phi-3 core.

use thiserror::Error;

/// Result type alias for Phi-3 operations.
pub type Result<T> = std::result::Result<T, Phi3Error>;

/// Errors that can occur while building or running the model.
#[derive(Error, Debug)]
pub enum Phi3Error {
    /// Invalid hyperparameter or scaling payload, detected at construction.
    #[error("invalid config `{field}`: {reason}")]
    InvalidConfig {
        /// Offending config field.
        field: &'static str,
        /// Violated constraint.
        reason: String,
    },

    /// A required forward input was not supplied.
    #[error("missing input: {0}")]
    MissingInput(String),

    /// Appending would write past the allocated cache length.
    #[error("cache overflow: {requested} positions requested, cache holds {max_length}")]
    CacheOverflow {
        /// Cursor position after the rejected append.
        requested: usize,
        /// Allocated cache length.
        max_length: usize,
    },

    /// Cache used outside its contract (bad block id, double append).
    #[error("cache error: {0}")]
    CacheError(String),

    /// Shape mismatch error.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// I/O error.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// Candle tensor error.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}

impl Phi3Error {
    pub(crate) fn config(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }
}
