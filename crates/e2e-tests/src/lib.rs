//! End-to-end test infrastructure for token-embed.
//!
//! Builds providers over the deterministic mock tokenizer and model so the
//! whole pipeline (subtokenize, window, run, stitch, pool, attach) can be
//! checked against vectors computed by hand.

use rand::rngs::StdRng;
use rand::Rng;

use embed_transformer::mock::{MockModel, MockTokenizer};
use embed_transformer::TransformerWordEmbeddings;
use embed_types::{Document, Sentence, Token, TransformerSettings};

/// Hidden states the mock model reports, embedding layer included.
pub const NUM_HIDDEN_STATES: usize = 5;

/// Hidden size of the mock model.
pub const HIDDEN_SIZE: usize = 4;

/// Index of the top layer, what `layers = "-1"` selects.
pub const TOP_LAYER: usize = NUM_HIDDEN_STATES - 1;

pub type MockProvider = TransformerWordEmbeddings<MockTokenizer, MockModel>;

/// Settings selecting only the top layer with first-subword pooling.
pub fn top_layer_settings() -> TransformerSettings {
    TransformerSettings {
        layers: "-1".to_string(),
        ..TransformerSettings::default()
    }
}

/// Provider over a position-independent mock model.
pub fn mock_provider(tokenizer: MockTokenizer, settings: TransformerSettings) -> MockProvider {
    TransformerWordEmbeddings::new(
        tokenizer,
        MockModel::new(NUM_HIDDEN_STATES, HIDDEN_SIZE),
        settings,
    )
    .expect("Failed to build mock provider")
}

/// Provider whose hidden states also depend on the model input length.
pub fn contextual_provider(tokenizer: MockTokenizer, settings: TransformerSettings) -> MockProvider {
    TransformerWordEmbeddings::new(
        tokenizer,
        MockModel::contextual(NUM_HIDDEN_STATES, HIDDEN_SIZE),
        settings,
    )
    .expect("Failed to build contextual provider")
}

/// Sentence of `count` distinct single-piece words: `{prefix}0 {prefix}1 ...`.
pub fn numbered_sentence(prefix: &str, count: usize) -> Sentence {
    Sentence::new((0..count).map(|i| format!("{}{}", prefix, i)))
}

/// Document whose sentences have the given word counts; sentence `s` uses
/// the prefix `s{s}w`.
pub fn numbered_document(word_counts: &[usize]) -> Document {
    Document::new(
        word_counts
            .iter()
            .enumerate()
            .map(|(s, &count)| numbered_sentence(&format!("s{}w", s), count))
            .collect(),
    )
}

/// Random lowercase word over `alphabet`, 1 to `max_len` characters.
pub fn random_word(rng: &mut StdRng, alphabet: &[char], max_len: usize) -> String {
    let len = rng.random_range(1..=max_len);
    (0..len)
        .map(|_| alphabet[rng.random_range(0..alphabet.len())])
        .collect()
}

/// Random sentence of 1 to `max_words` words.
pub fn random_sentence(rng: &mut StdRng, alphabet: &[char], max_words: usize, max_word_len: usize) -> Sentence {
    let words = rng.random_range(1..=max_words);
    Sentence::new((0..words).map(|_| random_word(rng, alphabet, max_word_len)))
}

/// Random document of `sentences` sentences.
pub fn random_document(
    rng: &mut StdRng,
    alphabet: &[char],
    sentences: usize,
    max_words: usize,
    max_word_len: usize,
) -> Document {
    Document::new(
        (0..sentences)
            .map(|_| random_sentence(rng, alphabet, max_words, max_word_len))
            .collect(),
    )
}

/// Expected top-layer vector of a single-piece word under a bert-style mock,
/// plus the per-row offset a contextual model adds.
pub fn expected_vector(word: &str, row_offset: f32) -> Vec<f32> {
    let id = MockTokenizer::piece_id(&word.to_lowercase());
    (0..HIDDEN_SIZE)
        .map(|d| MockModel::state_value(id, TOP_LAYER, d) + row_offset)
        .collect()
}

/// Offset the contextual mock adds for a model input of `row_len` ids.
pub fn row_offset(row_len: usize) -> f32 {
    row_len as f32 * 0.01
}

/// Vector stored on `token` under `name`.
pub fn vector_of(token: &Token, name: &str) -> Vec<f32> {
    token
        .embedding(name)
        .expect("Token has no vector under this name")
        .to_vec()
}

/// Element-wise comparison within `tolerance`.
pub fn approx_eq(a: &[f32], b: &[f32], tolerance: f32) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() <= tolerance)
}
