//! Subword-to-token alignment.
//!
//! A sentence is rendered as its token texts joined by spaces and tokenized
//! once. The resulting pieces are then walked left to right: each piece, with
//! its boundary markup stripped and lowercased, is appended to the current
//! token's reconstruction until that reconstruction equals the token's own
//! processed text. The number of pieces consumed is the token's subword count.
//!
//! Tokenizers drop characters (control and zero-width characters, some
//! accents) and occasionally emit markers nobody asked for, so the walk
//! tolerates a leading marker, tokens that vanish entirely, and single
//! character tokens trailing the sentence. Anything else is reported as a
//! mismatch and the remaining tokens get zero subwords.

use tracing::error;

use crate::error::EmbeddingError;
use crate::tokenizer::SubwordTokenizer;

/// Result of aligning a sentence's pieces to its tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenAlignment {
    /// Subwords per token; one entry per token
    pub lengths: Vec<usize>,
    /// Pieces skipped before the first consumed one
    pub skip_leading: usize,
    /// False when reconstruction gave up before the last token
    pub matched: bool,
}

impl TokenAlignment {
    /// Number of pieces consumed by the tokens.
    pub fn total(&self) -> usize {
        self.lengths.iter().sum()
    }
}

/// What the tokenizer makes of a single token's text: its pieces with
/// markup stripped, concatenated and lowercased. Markers are dropped unless
/// the token is the marker itself.
pub fn processed_token_text<T>(tokenizer: &T, text: &str) -> Result<String, EmbeddingError>
where
    T: SubwordTokenizer + ?Sized,
{
    let profile = tokenizer.profile();
    let pieces = tokenizer.tokenize(text)?;
    Ok(pieces
        .iter()
        .filter(|p| !profile.is_special(p) || p.as_str() == text)
        .map(|p| profile.markup.strip(p))
        .collect::<String>()
        .to_lowercase())
}

/// Align `pieces` (the tokenization of the joined sentence) to `token_texts`.
///
/// `lengths` always has one entry per token.
pub fn align_subwords<T>(
    tokenizer: &T,
    token_texts: &[String],
    pieces: &[String],
) -> Result<TokenAlignment, EmbeddingError>
where
    T: SubwordTokenizer + ?Sized,
{
    let n = token_texts.len();
    let profile = tokenizer.profile();
    let targets = token_texts
        .iter()
        .map(|t| processed_token_text(tokenizer, t))
        .collect::<Result<Vec<_>, _>>()?;

    let mut lengths: Vec<usize> = Vec::with_capacity(n);
    let mut skip_leading = 0;
    let mut reconstructed = String::new();
    let mut count = 0;
    let mut unmatched_piece = false;

    for (sub_idx, piece) in pieces.iter().enumerate() {
        if lengths.len() >= n {
            break;
        }
        if sub_idx == 0 && profile.is_special(piece) {
            skip_leading = 1;
            continue;
        }

        let piece_text = profile.markup.strip(piece).to_lowercase();

        // tokens the tokenizer dropped entirely never start with this piece
        if count == 0 {
            while lengths.len() < n && !targets[lengths.len()].starts_with(piece_text.as_str()) {
                lengths.push(0);
            }
            if lengths.len() >= n {
                unmatched_piece = true;
                break;
            }
        }

        reconstructed.push_str(&piece_text);
        count += 1;

        if reconstructed == targets[lengths.len()] {
            lengths.push(count);
            reconstructed.clear();
            count = 0;
        }
    }

    // trailing punctuation the tokenizer folded away
    while lengths.len() < n && token_texts[lengths.len()].chars().count() == 1 && count == 0 {
        lengths.push(0);
    }

    let matched = lengths.len() == n && !unmatched_piece;
    if !matched {
        let last_matched = lengths
            .iter()
            .rposition(|&l| l > 0)
            .map(|i| token_texts[i].as_str())
            .unwrap_or("<none>");
        error!(
            sentence = %token_texts.join(" "),
            last_matched = %last_matched,
            expected_last = %token_texts.last().map(String::as_str).unwrap_or(""),
            subwords = ?pieces,
            "Reconstructing tokens from subwords failed"
        );
        lengths.resize(n, 0);
    }

    Ok(TokenAlignment {
        lengths,
        skip_leading,
        matched,
    })
}

/// Keep at most `max` subwords per token, dropping from the middle: the first
/// `max - max / 2` and the last `max / 2` survive.
///
/// Returns the kept items and the new per-token lengths.
pub fn truncate_long_tokens<T: Clone>(items: &[T], lengths: &[usize], max: usize) -> (Vec<T>, Vec<usize>) {
    let mut kept = Vec::with_capacity(items.len());
    let mut new_lengths = Vec::with_capacity(lengths.len());
    let mut offset = 0;
    for &len in lengths {
        let span = &items[offset..offset + len];
        if len > max {
            let tail = max / 2;
            let head = max - tail;
            kept.extend_from_slice(&span[..head]);
            kept.extend_from_slice(&span[len - tail..]);
            new_lengths.push(max);
        } else {
            kept.extend_from_slice(span);
            new_lengths.push(len);
        }
        offset += len;
    }
    (kept, new_lengths)
}

/// Cut per-token lengths so that their sum fits `budget`; tokens past the
/// cut get zero subwords.
pub fn clip_lengths(lengths: &[usize], budget: usize) -> Vec<usize> {
    let mut remaining = budget;
    lengths
        .iter()
        .map(|&len| {
            let take = len.min(remaining);
            remaining -= take;
            take
        })
        .collect()
}
