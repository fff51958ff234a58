//! # embed-types
//!
//! Shared domain types for token-embed.
//!
//! This crate defines the objects embedding providers write into:
//! - Tokens: caller-level tokens carrying named vectors
//! - Sentences and documents: ordered token/sentence sequences
//! - Named caches: per-provider derived data owned by sentences and documents
//! - Settings: layered configuration
//!
//! ## Usage
//!
//! ```rust
//! use embed_types::Sentence;
//!
//! let sentence = Sentence::from_whitespace("The cat sat");
//! assert_eq!(sentence.len(), 3);
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod sentence;
pub mod token;

pub use cache::{ContextWindow, DocumentLayout, NamedCache, SentenceSubwords};
pub use config::{ContextMode, EmbedSettings, Pooling, TransformerSettings};
pub use error::TypesError;
pub use sentence::{Document, Sentence};
pub use token::{LookupMiss, Token};
