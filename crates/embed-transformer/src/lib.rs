//! # embed-transformer
//!
//! Transformer word embeddings aligned to caller tokens.
//!
//! A transformer sees subword pieces; callers see their own tokens. This
//! crate maps one onto the other and handles inputs longer than the model
//! accepts.
//!
//! ## Features
//! - Subword-to-token alignment tolerant of tokens the tokenizer drops
//! - Long sentences split into overlapping windows and stitched back
//! - Document context: per-sentence windows filled with neighbouring
//!   sentences, or one strided stream over the whole document
//! - Layer selection, first/last/first_last/mean pooling, scalar mix
//! - Local BERT inference via Candle, every hidden state exposed, with
//!   checkpoints from a local directory or the HuggingFace Hub cache
//!
//! ## Usage
//!
//! ```rust
//! use embed_transformer::mock::{MockModel, MockTokenizer};
//! use embed_transformer::{TokenEmbeddings, TransformerWordEmbeddings};
//! use embed_types::{Sentence, TransformerSettings};
//!
//! let settings = TransformerSettings {
//!     layers: "-1".to_string(),
//!     ..TransformerSettings::default()
//! };
//! let provider =
//!     TransformerWordEmbeddings::new(MockTokenizer::bert(512), MockModel::new(3, 4), settings).unwrap();
//!
//! let mut sentences = vec![Sentence::from_whitespace("The cat sat .")];
//! provider.embed(&mut sentences).unwrap();
//! assert_eq!(sentences[0].tokens()[0].embedding(provider.name()).unwrap().len(), 4);
//! ```

pub mod candle;
pub mod error;
pub mod extract;
pub mod mock;
pub mod model;
pub mod provider;
pub mod reconstruct;
pub mod stacked;
pub mod stitch;
pub mod tokenizer;
pub mod window;

pub use crate::candle::{load_bert, resolve_checkpoint, BertConfig, CandleBertModel, CheckpointFiles};
pub use error::EmbeddingError;
pub use extract::{parse_pooling, LayerExtractor, LayerSelection, ScalarMix};
pub use model::{probe, HiddenStateModel, ModelInfo, ModelProbe, TokenEmbeddings};
pub use provider::{window_geometry, TransformerWordEmbeddings, EOS_PLACEHOLDER};
pub use reconstruct::{align_subwords, processed_token_text, TokenAlignment};
pub use stacked::StackedEmbeddings;
pub use stitch::{stitch_windows, WindowTrim};
pub use tokenizer::{HfTokenizer, MarkupFamily, SubwordTokenizer, TokenizerProfile};
pub use window::{MarkerIds, WindowGeometry};
