//! Embedding error types.

use thiserror::Error;

/// Errors that can occur while building or running an embedding provider.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Candle model error
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Tokenizer error
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// Model file not found
    #[error("Model file not found: {0}")]
    ModelNotFound(String),

    /// Download error
    #[error("Failed to download model: {0}")]
    Download(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid provider configuration, raised at construction time
    #[error("Configuration error: {0}")]
    Config(String),

    /// Pooling rule outside {first, last, first_last, mean}
    #[error("Unknown pooling rule: {0}")]
    UnknownPooling(String),

    /// The chosen strategy needs a marker the tokenizer does not define
    #[error("Tokenizer has no {marker} marker, required by {mode}")]
    MissingMarker {
        marker: &'static str,
        mode: &'static str,
    },

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Dimension mismatch
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Stitched window positions disagree with the sentence's subword count
    #[error("Stitched length mismatch: expected {expected} positions, got {actual}")]
    StitchMismatch { expected: usize, actual: usize },

    /// Extracted span disagrees with the sum of per-token subword counts
    #[error("Extracted span mismatch: expected {expected} positions, got {actual}")]
    SpanMismatch { expected: usize, actual: usize },

    /// Error from the shared domain types
    #[error(transparent)]
    Types(#[from] embed_types::TypesError),
}
