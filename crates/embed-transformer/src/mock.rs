//! Deterministic tokenizer and model for tests and offline benchmarks.
//!
//! `MockTokenizer` splits words greedily against a small morph list and marks
//! pieces the way the configured [`MarkupFamily`] does. `MockModel` returns
//! hidden states that depend only on the input id, the layer and the hidden
//! dimension (plus, optionally, the unpadded length of the row), so expected
//! vectors can be computed by hand.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use candle_core::{Device, Tensor};

use crate::error::EmbeddingError;
use crate::model::HiddenStateModel;
use crate::tokenizer::{MarkupFamily, SubwordTokenizer, TokenizerProfile};

/// Ids below this are reserved for markers.
const FIRST_PIECE_ID: u32 = 1000;
const PIECE_ID_SPAN: u32 = 50_000;

/// Vocabulary-free tokenizer with predictable segmentation.
#[derive(Debug, Clone)]
pub struct MockTokenizer {
    morphs: Vec<String>,
    dropped: HashSet<String>,
    leading_piece: Option<String>,
    profile: TokenizerProfile,
}

impl MockTokenizer {
    /// Every word becomes a single piece unless a morph splits it.
    pub fn new(profile: TokenizerProfile) -> Self {
        Self {
            morphs: Vec::new(),
            dropped: HashSet::new(),
            leading_piece: None,
            profile,
        }
    }

    /// BERT-like profile with the given maximum length.
    pub fn bert(model_max_length: usize) -> Self {
        Self::new(TokenizerProfile::bert(model_max_length))
    }

    /// Split words at these morphs, longest match first.
    pub fn with_morphs(mut self, morphs: &[&str]) -> Self {
        self.morphs = morphs.iter().map(|m| m.to_lowercase()).collect();
        self.morphs.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
        self
    }

    /// Words that produce no pieces at all.
    pub fn with_dropped(mut self, words: &[&str]) -> Self {
        self.dropped = words.iter().map(|w| w.to_lowercase()).collect();
        self
    }

    /// Prepend `piece` to every tokenization, as some tokenizers prepend
    /// a marker even when asked not to.
    pub fn with_leading_piece(mut self, piece: &str) -> Self {
        self.leading_piece = Some(piece.to_string());
        self
    }

    /// Id assigned to a text piece; stable across runs.
    pub fn piece_id(piece: &str) -> u32 {
        // FNV-1a
        let mut hash: u32 = 0x811c_9dc5;
        for byte in piece.bytes() {
            hash ^= u32::from(byte);
            hash = hash.wrapping_mul(0x0100_0193);
        }
        FIRST_PIECE_ID + hash % PIECE_ID_SPAN
    }

    fn marker_id(&self, piece: &str) -> Option<u32> {
        let markers = [
            self.profile.begin_token.as_deref(),
            self.profile.separator_token.as_deref(),
            self.profile.end_token.as_deref(),
            self.profile.trailing_token.as_deref(),
        ];
        markers
            .iter()
            .flatten()
            .map(|m| m.to_string())
            .chain(self.profile.special_tokens.iter().cloned())
            .position(|m| m == piece)
            .map(|pos| pos as u32 + 1)
    }

    /// Split off single punctuation characters, as BERT-style
    /// pre-tokenizers do.
    fn pre_split(word: &str) -> Vec<String> {
        let mut parts = Vec::new();
        let mut current = String::new();
        for ch in word.chars() {
            if ch.is_alphanumeric() {
                current.push(ch);
            } else {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
                parts.push(ch.to_string());
            }
        }
        if !current.is_empty() {
            parts.push(current);
        }
        parts
    }

    fn segment(&self, part: &str) -> Vec<String> {
        let mut pieces = Vec::new();
        let mut rest = part;
        while !rest.is_empty() {
            match self.morphs.iter().find(|m| rest.starts_with(m.as_str())) {
                Some(morph) => {
                    pieces.push(morph.clone());
                    rest = &rest[morph.len()..];
                }
                None => {
                    // leftovers up to the next known morph form one piece
                    let cut = rest
                        .char_indices()
                        .skip(1)
                        .map(|(i, _)| i)
                        .find(|&i| self.morphs.iter().any(|m| rest[i..].starts_with(m.as_str())))
                        .unwrap_or(rest.len());
                    pieces.push(rest[..cut].to_string());
                    rest = &rest[cut..];
                }
            }
        }
        pieces
    }

    fn mark(&self, pieces: Vec<String>, word_initial: bool, after_space: bool) -> Vec<String> {
        let last = pieces.len().saturating_sub(1);
        pieces
            .into_iter()
            .enumerate()
            .map(|(i, piece)| match self.profile.markup {
                MarkupFamily::WordPiece if i > 0 => format!("##{}", piece),
                MarkupFamily::ByteLevel if i == 0 && after_space => format!("Ġ{}", piece),
                MarkupFamily::SentencePiece if i == 0 && word_initial => format!("▁{}", piece),
                MarkupFamily::Xlm if i == last => format!("{}</w>", piece),
                _ => piece,
            })
            .collect()
    }
}

impl Default for MockTokenizer {
    fn default() -> Self {
        Self::bert(512)
    }
}

impl SubwordTokenizer for MockTokenizer {
    fn tokenize(&self, text: &str) -> Result<Vec<String>, EmbeddingError> {
        let mut out: Vec<String> = self.leading_piece.iter().cloned().collect();
        for (w, raw) in text.split_whitespace().enumerate() {
            if self.marker_id(raw).is_some() {
                out.push(raw.to_string());
                continue;
            }
            // a literal leading Ġ reads as the word-boundary marker
            let raw = match self.profile.markup {
                MarkupFamily::ByteLevel => raw.strip_prefix('Ġ').unwrap_or(raw),
                _ => raw,
            };
            let word = raw.to_lowercase();
            if self.dropped.contains(&word) {
                continue;
            }
            for (p, part) in Self::pre_split(&word).into_iter().enumerate() {
                let pieces = self.segment(&part);
                out.extend(self.mark(pieces, p == 0, p == 0 && w > 0));
            }
        }
        Ok(out)
    }

    fn token_to_id(&self, piece: &str) -> Option<u32> {
        if piece.is_empty() {
            return None;
        }
        Some(self.marker_id(piece).unwrap_or_else(|| Self::piece_id(piece)))
    }

    fn profile(&self) -> &TokenizerProfile {
        &self.profile
    }
}

/// Hidden-state model with hand-computable outputs.
#[derive(Debug)]
pub struct MockModel {
    num_hidden_states: usize,
    hidden_size: usize,
    contextual: bool,
    device: Device,
    forward_calls: AtomicUsize,
    max_row_len: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
}

impl MockModel {
    /// `num_hidden_states` counts the embedding layer.
    pub fn new(num_hidden_states: usize, hidden_size: usize) -> Self {
        Self {
            num_hidden_states,
            hidden_size,
            contextual: false,
            device: Device::Cpu,
            forward_calls: AtomicUsize::new(0),
            max_row_len: AtomicUsize::new(0),
            batch_sizes: Mutex::new(Vec::new()),
        }
    }

    /// Variant whose states also depend on how long the row is.
    pub fn contextual(num_hidden_states: usize, hidden_size: usize) -> Self {
        Self {
            contextual: true,
            ..Self::new(num_hidden_states, hidden_size)
        }
    }

    /// State of a real (unmasked) position in a non-contextual model.
    pub fn state_value(id: u32, layer: usize, dim: usize) -> f32 {
        let mixed = u64::from(id) * 31 + layer as u64 * 17 + dim as u64 * 7;
        (mixed % 101) as f32 / 101.0 + layer as f32
    }

    /// Full hidden vector of `id` at `layer`.
    pub fn state_vector(&self, id: u32, layer: usize) -> Vec<f32> {
        (0..self.hidden_size)
            .map(|d| Self::state_value(id, layer, d))
            .collect()
    }

    pub fn forward_calls(&self) -> usize {
        self.forward_calls.load(Ordering::SeqCst)
    }

    /// Longest unpadded row seen so far.
    pub fn max_row_len(&self) -> usize {
        self.max_row_len.load(Ordering::SeqCst)
    }

    /// Batch size of every forward pass, in call order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes
            .lock()
            .map(|sizes| sizes.clone())
            .unwrap_or_default()
    }
}

impl Default for MockModel {
    fn default() -> Self {
        Self::new(5, 4)
    }
}

impl HiddenStateModel for MockModel {
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor, EmbeddingError> {
        let (batch, seq) = input_ids.dims2()?;
        let ids: Vec<Vec<u32>> = input_ids.to_vec2()?;
        let mask: Vec<Vec<u32>> = attention_mask.to_vec2()?;

        self.forward_calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut sizes) = self.batch_sizes.lock() {
            sizes.push(batch);
        }
        for row in &mask {
            let real = row.iter().filter(|&&m| m != 0).count();
            self.max_row_len.fetch_max(real, Ordering::SeqCst);
        }

        let context: Vec<f32> = mask
            .iter()
            .map(|row| {
                if self.contextual {
                    row.iter().filter(|&&m| m != 0).count() as f32 * 0.01
                } else {
                    0.0
                }
            })
            .collect();

        let mut data = Vec::with_capacity(self.num_hidden_states * batch * seq * self.hidden_size);
        for layer in 0..self.num_hidden_states {
            for b in 0..batch {
                for p in 0..seq {
                    for d in 0..self.hidden_size {
                        let value = if mask[b][p] == 0 {
                            0.0
                        } else {
                            Self::state_value(ids[b][p], layer, d) + context[b]
                        };
                        data.push(value);
                    }
                }
            }
        }

        Ok(Tensor::from_vec(
            data,
            (self.num_hidden_states, batch, seq, self.hidden_size),
            &self.device,
        )?)
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_piece_segmentation() {
        let tok = MockTokenizer::bert(512).with_morphs(&["eat", "ing", "quick"]);
        let pieces = tok.tokenize("Eating quickly").unwrap();
        assert_eq!(pieces, vec!["eat", "##ing", "quick", "##ly"]);
    }

    #[test]
    fn test_byte_level_marks_words_after_space() {
        let tok = MockTokenizer::new(TokenizerProfile::roberta(512)).with_morphs(&["eat", "quick"]);
        let pieces = tok.tokenize("Ġeating quickly").unwrap();
        assert_eq!(pieces, vec!["eat", "ing", "Ġquick", "ly"]);
    }

    #[test]
    fn test_punctuation_split() {
        let tok = MockTokenizer::bert(512);
        assert_eq!(tok.tokenize("cat.").unwrap(), vec!["cat", "."]);
    }

    #[test]
    fn test_markers_stay_whole() {
        let tok = MockTokenizer::bert(512);
        assert_eq!(tok.tokenize("end [SEP]").unwrap(), vec!["end", "[SEP]"]);
    }

    #[test]
    fn test_dropped_words_vanish() {
        let tok = MockTokenizer::bert(512).with_dropped(&["\u{200b}"]);
        assert_eq!(tok.tokenize("a \u{200b} b").unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_marker_ids_are_reserved() {
        let tok = MockTokenizer::bert(512);
        let cls = tok.token_to_id("[CLS]").unwrap();
        let sep = tok.token_to_id("[SEP]").unwrap();
        assert!(cls < FIRST_PIECE_ID);
        assert!(sep < FIRST_PIECE_ID);
        assert_ne!(cls, sep);
        assert!(tok.token_to_id("cat").unwrap() >= FIRST_PIECE_ID);
        assert!(tok.token_to_id("").is_none());
    }

    #[test]
    fn test_model_masks_padding() {
        let model = MockModel::new(2, 3);
        let ids = Tensor::new(&[[1001u32, 1002]], &Device::Cpu).unwrap();
        let mask = Tensor::new(&[[1u32, 0]], &Device::Cpu).unwrap();
        let out = model.forward(&ids, &mask).unwrap();
        assert_eq!(out.dims(), &[2, 1, 2, 3]);
        let layer1 = out.get(1).unwrap().get(0).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(layer1[0], model.state_vector(1001, 1));
        assert_eq!(layer1[1], vec![0.0; 3]);
        assert_eq!(model.forward_calls(), 1);
        assert_eq!(model.max_row_len(), 1);
        assert_eq!(model.batch_sizes(), vec![1]);
    }
}
