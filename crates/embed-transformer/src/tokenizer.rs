//! Tokenizer adapter contract.
//!
//! Providers never inspect a tokenizer's concrete type. Everything that varies
//! between model families (markers, continuation markup, special tokens, the
//! maximum sequence length) is described by a [`TokenizerProfile`].

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::error::EmbeddingError;

/// How a tokenizer family marks word boundaries inside its pieces.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MarkupFamily {
    /// BERT-style: continuation pieces start with `##`
    #[default]
    WordPiece,
    /// GPT-2/RoBERTa-style: word-initial pieces start with `Ġ`
    ByteLevel,
    /// XLNet/T5/XLM-R-style: word-initial pieces start with `▁`
    SentencePiece,
    /// XLM-style: word-final pieces end with `</w>`
    Xlm,
    /// Pieces carry no boundary markup
    Plain,
}

impl MarkupFamily {
    /// Remove this family's boundary markup from a piece.
    pub fn strip<'a>(&self, piece: &'a str) -> &'a str {
        match self {
            MarkupFamily::WordPiece => piece.strip_prefix("##").unwrap_or(piece),
            MarkupFamily::ByteLevel => piece.strip_prefix('Ġ').unwrap_or(piece),
            MarkupFamily::SentencePiece => piece.strip_prefix('▁').unwrap_or(piece),
            MarkupFamily::Xlm => piece.strip_suffix("</w>").unwrap_or(piece),
            MarkupFamily::Plain => piece,
        }
    }
}

/// Capability descriptor of a tokenizer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenizerProfile {
    /// Marker placed before a window's content (e.g. `[CLS]`, `<s>`)
    pub begin_token: Option<String>,
    /// Marker separating segments (e.g. `[SEP]`, `</s>`)
    pub separator_token: Option<String>,
    /// Marker placed after a window's content; falls back to the separator
    pub end_token: Option<String>,
    /// Marker following the closing marker (XLNet's final `<cls>`)
    #[serde(default)]
    pub trailing_token: Option<String>,
    /// Pieces that are markers rather than text
    pub special_tokens: Vec<String>,
    /// Boundary markup to strip while matching pieces to tokens
    pub markup: MarkupFamily,
    /// Maximum input length of the model, markers included
    pub model_max_length: usize,
}

impl TokenizerProfile {
    /// BERT-like: `[CLS] ... [SEP]`, `##` continuations.
    pub fn bert(model_max_length: usize) -> Self {
        Self {
            begin_token: Some("[CLS]".to_string()),
            separator_token: Some("[SEP]".to_string()),
            end_token: Some("[SEP]".to_string()),
            trailing_token: None,
            special_tokens: vec!["[CLS]".to_string(), "[SEP]".to_string()],
            markup: MarkupFamily::WordPiece,
            model_max_length,
        }
    }

    /// RoBERTa-like: `<s> ... </s>`, `Ġ` word starts.
    pub fn roberta(model_max_length: usize) -> Self {
        Self {
            begin_token: Some("<s>".to_string()),
            separator_token: Some("</s>".to_string()),
            end_token: Some("</s>".to_string()),
            trailing_token: None,
            special_tokens: vec!["<s>".to_string(), "</s>".to_string()],
            markup: MarkupFamily::ByteLevel,
            model_max_length,
        }
    }

    /// XLNet-like: no leading marker, `... <sep> <cls>`, `▁` word starts.
    pub fn xlnet(model_max_length: usize) -> Self {
        Self {
            begin_token: None,
            separator_token: Some("<sep>".to_string()),
            end_token: Some("<sep>".to_string()),
            trailing_token: Some("<cls>".to_string()),
            special_tokens: vec!["<cls>".to_string(), "<sep>".to_string()],
            markup: MarkupFamily::SentencePiece,
            model_max_length,
        }
    }

    /// Marker closing a window: the end marker, else the separator.
    pub fn closing_token(&self) -> Option<&str> {
        self.end_token
            .as_deref()
            .or(self.separator_token.as_deref())
    }

    /// Positions occupied by markers before a window's content
    pub fn begin_offset(&self) -> usize {
        usize::from(self.begin_token.is_some())
    }

    /// Positions occupied by markers after a window's content
    pub fn end_offset(&self) -> usize {
        usize::from(self.closing_token().is_some()) + usize::from(self.trailing_token.is_some())
    }

    pub fn is_special(&self, piece: &str) -> bool {
        self.special_tokens.iter().any(|s| s == piece)
    }
}

/// Maps text to subword pieces and pieces to ids.
pub trait SubwordTokenizer {
    /// Split `text` into subword pieces, markup included, without markers.
    fn tokenize(&self, text: &str) -> Result<Vec<String>, EmbeddingError>;

    /// Vocabulary id of a single piece.
    fn token_to_id(&self, piece: &str) -> Option<u32>;

    fn profile(&self) -> &TokenizerProfile;

    /// Vocabulary ids of `pieces`, in order.
    fn convert_tokens_to_ids(&self, pieces: &[String]) -> Result<Vec<u32>, EmbeddingError> {
        pieces
            .iter()
            .map(|p| {
                self.token_to_id(p)
                    .ok_or_else(|| EmbeddingError::Tokenizer(format!("piece '{}' not in vocabulary", p)))
            })
            .collect()
    }

    fn model_max_length(&self) -> usize {
        self.profile().model_max_length
    }
}

/// Adapter over a HuggingFace `tokenizers` tokenizer.
pub struct HfTokenizer {
    inner: Tokenizer,
    profile: TokenizerProfile,
}

impl HfTokenizer {
    pub fn new(inner: Tokenizer, profile: TokenizerProfile) -> Self {
        Self { inner, profile }
    }

    /// Load `tokenizer.json` from disk.
    pub fn from_file(path: &Path, profile: TokenizerProfile) -> Result<Self, EmbeddingError> {
        let inner =
            Tokenizer::from_file(path).map_err(|e| EmbeddingError::Tokenizer(e.to_string()))?;
        Ok(Self::new(inner, profile))
    }
}

impl SubwordTokenizer for HfTokenizer {
    fn tokenize(&self, text: &str) -> Result<Vec<String>, EmbeddingError> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| EmbeddingError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_tokens().to_vec())
    }

    fn token_to_id(&self, piece: &str) -> Option<u32> {
        self.inner.token_to_id(piece)
    }

    fn profile(&self) -> &TokenizerProfile {
        &self.profile
    }
}
