//! Error types shared by the token-embed crates.

use thiserror::Error;

/// Errors raised by the domain types and the settings loader.
#[derive(Debug, Error)]
pub enum TypesError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input error
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
